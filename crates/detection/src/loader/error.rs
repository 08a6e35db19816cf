//! Error types and load result structures for the policy loader.

use std::path::PathBuf;

use stackwatch_core::StackwatchError;

/// Errors that can occur while loading or writing policy files.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but is not a usable policy.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Notify watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, LoaderError>;

impl From<LoaderError> for StackwatchError {
    fn from(e: LoaderError) -> Self {
        match e {
            LoaderError::Io(io) => StackwatchError::Io(io),
            other => StackwatchError::Store(other.to_string()),
        }
    }
}

/// Outcome of loading a single policy file.
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub status: LoadStatus,
}

#[derive(Debug)]
pub enum LoadStatus {
    Loaded { policy_id: String },
    /// Dotfile or non-YAML file.
    Skipped { reason: String },
    Failed { error: String },
}

impl LoadResult {
    pub fn is_loaded(&self) -> bool {
        matches!(self.status, LoadStatus::Loaded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, LoadStatus::Failed { .. })
    }
}
