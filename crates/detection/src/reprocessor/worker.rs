use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use stackwatch_core::{Alert, LifecycleStage};

use super::task::Task;
use crate::alert_manager::{AlertDiff, AlertManager};
use crate::detector::{DeployContext, DeployTimeDetector};
use crate::error::Result;
use crate::policy_set::PolicySet;
use crate::store::{AlertQuery, EntityStore};

/// Re-runs deploy-time detection for queued tasks and policy changes and
/// reconciles the outcome against stored alerts.
pub struct TaskWorker {
    policy_set: Arc<PolicySet>,
    detector: Arc<DeployTimeDetector>,
    entities: Arc<dyn EntityStore>,
    alerts: Arc<AlertManager>,
}

impl TaskWorker {
    pub fn new(
        policy_set: Arc<PolicySet>,
        detector: Arc<DeployTimeDetector>,
        entities: Arc<dyn EntityStore>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            policy_set,
            detector,
            entities,
            alerts,
        }
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    /// Process one task.
    ///
    /// A removal, or a deployment that no longer exists, leaves nothing to
    /// detect: every matching previous alert goes stale.
    pub async fn process(&self, task: &Task) -> Result<AlertDiff> {
        let mut query = AlertQuery::for_entity(&task.deployment_id);
        if let Some(policy_id) = &task.policy_id {
            query = query.with_policy(policy_id);
        }

        if task.is_removal() {
            return self.alerts.reconcile(&query, Vec::new()).await;
        }
        let Some(deployment) = self.entities.get_deployment(&task.deployment_id).await? else {
            debug!(deployment_id = %task.deployment_id, "deployment gone, treating as removal");
            return self.alerts.reconcile(&query, Vec::new()).await;
        };

        let images = self.entities.get_images(&deployment).await?;
        let ctx = DeployContext::new(task.action);
        let current = match &task.policy_id {
            Some(policy_id) => {
                match self.detector.detect_for_policy(ctx, &deployment, &images, policy_id) {
                    Ok(alerts) => alerts,
                    // Removed since the task was queued.
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            None => self.detector.detect(ctx, &deployment, &images)?,
        };
        self.alerts
            .reconcile(&query.with_stage(LifecycleStage::Deploy), current)
            .await
    }

    /// Re-evaluate one policy across the fleet.
    ///
    /// A policy that is no longer installed has all of its alerts marked stale.
    pub async fn reprocess_policy(&self, policy_id: &str) -> Result<AlertDiff> {
        if !self.policy_set.exists(policy_id) {
            info!(policy_id, "policy removed, retiring its alerts");
            return self
                .alerts
                .reconcile(&AlertQuery::for_policy(policy_id), Vec::new())
                .await;
        }
        let current: Vec<Alert> = match self.detector.alerts_for_policy(policy_id).await {
            Ok(alerts) => alerts,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let query = AlertQuery::for_policy(policy_id).with_stage(LifecycleStage::Deploy);
        self.alerts.reconcile(&query, current).await
    }

    /// Drain `tasks` until every sender is gone. Failures are logged and the
    /// loop moves on.
    pub(crate) async fn run(self: Arc<Self>, mut tasks: mpsc::Receiver<Task>) {
        info!("reprocessing worker started");
        let mut processed = 0usize;
        while let Some(task) = tasks.recv().await {
            match self.process(&task).await {
                Ok(diff) => {
                    debug!(
                        task = %task,
                        new = diff.new.len(),
                        updated = diff.updated.len(),
                        stale = diff.stale.len(),
                        "task processed"
                    );
                }
                Err(e) => warn!(task = %task, error = %e, "reprocessing task failed"),
            }
            processed += 1;
        }
        info!(processed, "reprocessing worker stopped");
    }
}
