use thiserror::Error;

/// Errors surfaced by the collaborators around the detection core
/// (policy, alert and entity stores, notifiers).
#[derive(Error, Debug)]
pub enum StackwatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for StackwatchError {
    fn from(e: serde_json::Error) -> Self {
        StackwatchError::Serialize(e.to_string())
    }
}

/// Result alias for collaborator operations.
pub type Result<T> = std::result::Result<T, StackwatchError>;
