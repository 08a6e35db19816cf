//! Collaborator interfaces consumed by the engine.
//!
//! Persistence, entity lookup and notification delivery live outside the
//! engine. Implementations are assumed to be individually thread-safe; the
//! engine adds no locking around them.

use async_trait::async_trait;

use stackwatch_core::{Alert, Deployment, Image, LifecycleStage, Policy, Result};

/// Source of truth for policy documents.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policies(&self) -> Result<Vec<Policy>>;

    async fn update_policy(&self, policy: &Policy) -> Result<()>;
}

/// Filter for [`AlertStore::search_raw_alerts`]. Unset parts match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertQuery {
    pub policy_id: Option<String>,
    pub entity_id: Option<String>,
    pub stage: Option<LifecycleStage>,
    /// Stale alerts are excluded unless set.
    pub include_stale: bool,
}

impl AlertQuery {
    pub fn for_policy(policy_id: impl Into<String>) -> Self {
        Self {
            policy_id: Some(policy_id.into()),
            ..Default::default()
        }
    }

    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn with_stage(mut self, stage: LifecycleStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        (self.include_stale || !alert.stale)
            && self.policy_id.as_deref().map_or(true, |id| id == alert.policy_id())
            && self.entity_id.as_deref().map_or(true, |id| id == alert.entity_id())
            && self.stage.map_or(true, |s| s == alert.lifecycle_stage)
    }
}

/// Alert persistence.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn search_raw_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;

    async fn add_alert(&self, alert: &Alert) -> Result<()>;

    async fn update_alert(&self, alert: &Alert) -> Result<()>;
}

/// Deployment and image datastore.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_deployments(&self) -> Result<Vec<Deployment>>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>>;

    /// Images run by the deployment's containers; unknown images are omitted.
    async fn get_images(&self, deployment: &Deployment) -> Result<Vec<Image>>;
}

/// Delivery of newly raised alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn process_alert(&self, alert: &Alert) -> Result<()>;
}
