//! Policy detection engine.
//!
//! This crate provides:
//! - Predicate/matcher combinators and a compiler from policy documents to them
//! - A lock-protected set of compiled policies
//! - Build-time, deploy-time and runtime detectors
//! - Alert reconciliation and enforcement resolution
//! - A throttled background reprocessing pipeline
//! - A filesystem policy loader with hot-reload via `notify` watcher

pub mod alert_manager;
pub mod category;
pub mod combinators;
pub mod compiler;
pub mod context;
pub mod detector;
pub mod enforcement;
pub mod entity;
pub mod error;
pub mod loader;
pub mod memory;
pub mod policy_set;
pub mod reprocessor;
pub mod search;
pub mod store;

pub use alert_manager::{AlertDiff, AlertManager};
pub use category::{make_category_filter, CategoryFilter, PolicyFilter};
pub use compiler::{compile, CompiledPolicy};
pub use context::{Collaborators, DeploymentVerdict, DetectionContext};
pub use entity::EntityRef;
pub use error::{CompileError, DetectionError, ErrorList, Result};
pub use policy_set::PolicySet;
