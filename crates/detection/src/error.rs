//! Error taxonomy of the detection engine.

use std::fmt;

use stackwatch_core::StackwatchError;

/// Reasons a single policy fails to compile.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// A criterion carries a pattern the regex engine rejects.
    #[error("invalid regular expression '{pattern}' in {field}: {source}")]
    InvalidRegex {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A criterion is malformed or contradicts the rest of the policy.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("policy must apply to at least one lifecycle stage")]
    MissingLifecycleStage,
}

/// Errors produced by the detection engine.
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    /// The policy could not be compiled and was not installed.
    #[error("failed to compile policy '{policy}': {source}")]
    Compile {
        policy: String,
        #[source]
        source: CompileError,
    },

    /// A matcher or index query failed while evaluating one (policy, entity) pair.
    #[error("policy '{policy}' failed on {entity}: {reason}")]
    Match {
        policy: String,
        entity: String,
        reason: String,
    },

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// A search query names a field the index does not know.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// A collaborator (store, notifier, searcher) failed.
    #[error(transparent)]
    Store(#[from] StackwatchError),

    /// Several independent operations failed in one batch.
    #[error("{0}")]
    Aggregate(ErrorList),

    #[error("reprocessing queue is closed")]
    QueueClosed,
}

impl DetectionError {
    /// Whether this is the "nothing to do" case of an unknown policy id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DetectionError::PolicyNotFound(_))
    }

    /// Attach policy and entity context to a failure inside a matcher.
    pub fn in_match(self, policy: &str, entity: &str) -> Self {
        match self {
            DetectionError::Match { reason, .. } => DetectionError::Match {
                policy: policy.to_string(),
                entity: entity.to_string(),
                reason,
            },
            other => DetectionError::Match {
                policy: policy.to_string(),
                entity: entity.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Result alias for detection operations.
pub type Result<T> = std::result::Result<T, DetectionError>;

// ── Error aggregation ───────────────────────────────────────────────

/// Collects failures of independent operations so one failure does not stop
/// the rest of a batch.
#[derive(Debug, Default)]
pub struct ErrorList {
    prefix: String,
    errors: Vec<String>,
}

impl ErrorList {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            errors: Vec::new(),
        }
    }

    /// Record the error of `result`, if any.
    pub fn add<T, E: fmt::Display>(&mut self, result: std::result::Result<T, E>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e.to_string());
                None
            }
        }
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, otherwise [`DetectionError::Aggregate`].
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DetectionError::Aggregate(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix)?;
        if !self.prefix.is_empty() {
            write!(f, ": ")?;
        }
        write!(f, "[{}]", self.errors.join(", "))
    }
}
