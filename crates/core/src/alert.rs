//! Alerts: persisted records of policy violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Deployment, Image, ImageName, ProcessIndicator};
use crate::policy::{EnforcementAction, LifecycleStage, Policy};

/// One rule breach, with the values that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub message: String,
    /// Name of the criterion that produced the violation.
    #[serde(default)]
    pub field: String,
    /// Matched value(s).
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: field.into(),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, value: impl Into<String>) -> Self {
        self.evidence.push(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enforcement {
    pub action: EnforcementAction,
    pub message: String,
}

/// Deployment fields captured at alert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDeployment {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub cluster_id: String,
    pub cluster_name: String,
    #[serde(rename = "type")]
    pub deployment_type: String,
    #[serde(default)]
    pub inactive: bool,
}

impl From<&Deployment> for AlertDeployment {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            namespace: d.namespace.clone(),
            cluster_id: d.cluster_id.clone(),
            cluster_name: d.cluster_name.clone(),
            deployment_type: d.deployment_type.clone(),
            inactive: d.inactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertImage {
    pub id: String,
    pub name: ImageName,
}

impl From<&Image> for AlertImage {
    fn from(i: &Image) -> Self {
        Self {
            id: i.id.clone(),
            name: i.name.clone(),
        }
    }
}

/// The entity an alert was raised against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEntity {
    Deployment(AlertDeployment),
    Image(AlertImage),
}

impl AlertEntity {
    pub fn id(&self) -> &str {
        match self {
            AlertEntity::Deployment(d) => &d.id,
            AlertEntity::Image(i) => &i.id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            AlertEntity::Deployment(d) => d.name.clone(),
            AlertEntity::Image(i) => i.name.to_string(),
        }
    }

    pub fn as_deployment(&self) -> Option<&AlertDeployment> {
        match self {
            AlertEntity::Deployment(d) => Some(d),
            AlertEntity::Image(_) => None,
        }
    }
}

/// `(policy id, entity id)`; at most one non-stale alert exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub policy_id: String,
    pub entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub lifecycle_stage: LifecycleStage,
    /// Snapshot of the policy when the alert was produced.
    pub policy: Policy,
    pub entity: AlertEntity,
    pub violations: Vec<Violation>,
    /// Offending processes, runtime alerts only.
    #[serde(default)]
    pub processes: Vec<ProcessIndicator>,
    #[serde(default)]
    pub enforcement: Option<Enforcement>,
    /// Latest violation time.
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub first_occurred: Option<DateTime<Utc>>,
    #[serde(default)]
    pub marked_stale: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stale: bool,
}

impl Alert {
    /// A fresh alert with a new id, timestamped now.
    pub fn new(
        stage: LifecycleStage,
        policy: &Policy,
        entity: AlertEntity,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lifecycle_stage: stage,
            policy: policy.clone(),
            entity,
            violations,
            processes: Vec::new(),
            enforcement: None,
            time: Utc::now(),
            first_occurred: None,
            marked_stale: None,
            stale: false,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            policy_id: self.policy.id.clone(),
            entity_id: self.entity.id().to_string(),
        }
    }

    pub fn policy_id(&self) -> &str {
        &self.policy.id
    }

    pub fn entity_id(&self) -> &str {
        self.entity.id()
    }

    pub fn enforcement_action(&self) -> EnforcementAction {
        self.enforcement
            .as_ref()
            .map(|e| e.action)
            .unwrap_or_default()
    }
}
