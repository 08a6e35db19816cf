pub mod alert;
pub mod config;
pub mod entity;
pub mod error;
pub mod policy;

pub use alert::*;
pub use config::DetectionConfig;
pub use entity::*;
pub use error::*;
pub use policy::*;
