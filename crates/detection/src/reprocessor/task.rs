use std::fmt;

use serde::{Deserialize, Serialize};

use stackwatch_core::ResourceAction;

/// Unit of work on the reprocessing queue: re-evaluate one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub deployment_id: String,
    pub action: ResourceAction,
    /// Policy to evaluate against; `None` means every policy.
    #[serde(default)]
    pub policy_id: Option<String>,
}

impl Task {
    pub fn new(deployment_id: impl Into<String>, action: ResourceAction) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            action,
            policy_id: None,
        }
    }

    pub fn for_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn is_removal(&self) -> bool {
        self.action == ResourceAction::Remove
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.deployment_id)?;
        if let Some(policy_id) = &self.policy_id {
            write!(f, " against {policy_id}")?;
        }
        Ok(())
    }
}
