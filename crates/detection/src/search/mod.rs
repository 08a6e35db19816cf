//! Structured search over flattened deployment documents.
//!
//! Compiled policies carry a [`Query`] derived from their indexable criteria.
//! A [`Searcher`] answers it with candidate deployment ids; candidates are
//! always re-validated by the policy's predicate and matcher.

mod index;

pub use index::{Document, MemoryIndex};

use regex::Regex;

use stackwatch_core::{Deployment, Image};

use crate::error::{DetectionError, Result};

// ── Fields ──────────────────────────────────────────────────────────

pub const IMAGE_REGISTRY: &str = "image.registry";
pub const IMAGE_REMOTE: &str = "image.remote";
pub const IMAGE_TAG: &str = "image.tag";
pub const CONTAINER_PRIVILEGED: &str = "container.privileged";
pub const DEPLOYMENT_NAME: &str = "deployment.name";
pub const DEPLOYMENT_NAMESPACE: &str = "deployment.namespace";
pub const DEPLOYMENT_CLUSTER: &str = "deployment.cluster";

/// Every field a document carries.
pub const FIELDS: &[&str] = &[
    IMAGE_REGISTRY,
    IMAGE_REMOTE,
    IMAGE_TAG,
    CONTAINER_PRIVILEGED,
    DEPLOYMENT_NAME,
    DEPLOYMENT_NAMESPACE,
    DEPLOYMENT_CLUSTER,
];

// ── Query ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ValueMatch {
    Regex(Regex),
    Exact(String),
    AnyOf(Vec<String>),
}

impl ValueMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            ValueMatch::Regex(re) => re.is_match(value),
            ValueMatch::Exact(v) => v == value,
            ValueMatch::AnyOf(values) => values.iter().any(|v| v == value),
        }
    }
}

/// One field condition; satisfied when any value of the field matches.
#[derive(Debug, Clone)]
pub struct Clause {
    pub field: String,
    pub value: ValueMatch,
}

/// Conjunction of clauses. An empty query matches every document.
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: ValueMatch) -> Self {
        self.clauses.push(Clause {
            field: field.into(),
            value,
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Reject clauses over fields no document carries.
    pub fn validate(&self) -> Result<()> {
        match self
            .clauses
            .iter()
            .find(|c| !FIELDS.contains(&c.field.as_str()))
        {
            Some(clause) => Err(DetectionError::MalformedQuery(format!(
                "unknown field '{}'",
                clause.field
            ))),
            None => Ok(()),
        }
    }
}

/// Answers queries with matching deployment ids.
pub trait Searcher: Send + Sync {
    fn search(&self, query: &Query) -> Result<Vec<String>>;
}

/// Keeps a durable index in step with deployment changes.
pub trait Indexer: Send + Sync {
    fn index_deployment(&self, deployment: &Deployment, images: &[Image]);

    fn remove_deployment(&self, deployment_id: &str);
}
