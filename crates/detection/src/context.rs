//! The engine assembled around its collaborators.
//!
//! [`DetectionContext`] is built once at process start and handed to whatever
//! serves requests. Construction failures come back as errors.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use stackwatch_core::{
    Alert, DetectionConfig, Deployment, Enforcement, Image, LifecycleStage, Policy,
    ProcessIndicator, ResourceAction,
};

use crate::alert_manager::{AlertDiff, AlertManager};
use crate::category::PolicyFilter;
use crate::detector::{BuildTimeDetector, DeployContext, DeployTimeDetector, RuntimeDetector};
use crate::enforcement::resolve_enforcement;
use crate::error::Result;
use crate::memory::{LogNotifier, MemoryAlertStore, MemoryEntityStore, MemoryPolicyStore};
use crate::policy_set::PolicySet;
use crate::reprocessor::{Reprocessor, Task, TaskWorker};
use crate::search::{Indexer, MemoryIndex, Searcher};
use crate::store::{AlertQuery, AlertStore, EntityStore, Notifier, PolicyStore};

/// External systems the engine reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub policies: Arc<dyn PolicyStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub entities: Arc<dyn EntityStore>,
    pub notifier: Arc<dyn Notifier>,
    /// Durable index answering fleet-wide policy queries.
    pub searcher: Arc<dyn Searcher>,
    /// Write side of the same index.
    pub indexer: Arc<dyn Indexer>,
}

impl Collaborators {
    /// In-memory stores, a shared in-memory index and a log notifier.
    pub fn in_memory() -> Self {
        let index = Arc::new(MemoryIndex::new());
        Self {
            policies: Arc::new(MemoryPolicyStore::new()),
            alerts: Arc::new(MemoryAlertStore::new()),
            entities: Arc::new(MemoryEntityStore::new()),
            notifier: Arc::new(LogNotifier),
            searcher: index.clone(),
            indexer: index,
        }
    }

    pub fn with_policy_store(mut self, policies: Arc<dyn PolicyStore>) -> Self {
        self.policies = policies;
        self
    }
}

/// Outcome of an admission-style deployment check.
#[derive(Debug, Clone)]
pub struct DeploymentVerdict {
    /// Alerts detected in this pass.
    pub alerts: Vec<Alert>,
    /// The single action to apply, if any.
    pub enforcement: Option<Enforcement>,
    /// What reconciliation changed in the alert store.
    pub diff: AlertDiff,
}

pub struct DetectionContext {
    config: DetectionConfig,
    policy_set: Arc<PolicySet>,
    build_time: BuildTimeDetector,
    deploy_time: Arc<DeployTimeDetector>,
    runtime: RuntimeDetector,
    alerts: Arc<AlertManager>,
    reprocessor: Reprocessor,
    indexer: Arc<dyn Indexer>,
}

impl DetectionContext {
    /// Wire the engine and install every policy the policy store holds.
    ///
    /// Background work does not begin until [`start`](Self::start).
    pub async fn new(collaborators: Collaborators, config: DetectionConfig) -> Result<Self> {
        let Collaborators {
            policies,
            alerts,
            entities,
            notifier,
            searcher,
            indexer,
        } = collaborators;

        let policy_set = Arc::new(PolicySet::new(policies));
        policy_set.load_from_store().await?;

        let deploy_time = Arc::new(DeployTimeDetector::new(
            policy_set.clone(),
            searcher,
            entities.clone(),
            config.scale_to_zero_enabled,
        ));
        let alerts = Arc::new(AlertManager::new(alerts, notifier));
        let worker = TaskWorker::new(
            policy_set.clone(),
            deploy_time.clone(),
            entities,
            alerts.clone(),
        );
        let reprocessor = Reprocessor::new(worker, &config);

        info!(policies = policy_set.len(), "detection context ready");
        Ok(Self {
            build_time: BuildTimeDetector::new(policy_set.clone()),
            runtime: RuntimeDetector::new(policy_set.clone()),
            config,
            policy_set,
            deploy_time,
            alerts,
            reprocessor,
            indexer,
        })
    }

    /// Start the reprocessing worker and periodic timer.
    pub fn start(&self) -> Result<()> {
        self.reprocessor.start()
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn policy_set(&self) -> &Arc<PolicySet> {
        &self.policy_set
    }

    pub fn reprocessor(&self) -> &Reprocessor {
        &self.reprocessor
    }

    // ── Policy lifecycle ────────────────────────────────────────────

    /// Compile and install `policy`, then schedule a fleet re-evaluation.
    pub fn upsert_policy(&self, policy: &Policy) -> Result<()> {
        self.policy_set.upsert_policy(policy)?;
        self.reprocessor.policy_changed(&policy.id);
        Ok(())
    }

    /// Uninstall a policy; its alerts go stale on the next reprocessing pass.
    pub fn remove_policy(&self, policy_id: &str) -> Result<()> {
        self.policy_set.remove_policy(policy_id)?;
        self.reprocessor.policy_changed(policy_id);
        Ok(())
    }

    pub async fn remove_notifier(&self, notifier_id: &str) -> Result<()> {
        self.policy_set.remove_notifier(notifier_id).await
    }

    // ── Detection ───────────────────────────────────────────────────

    /// Build-time check of one image.
    pub fn detect_image(&self, image: &Image, filters: &[&dyn PolicyFilter]) -> Result<Vec<Alert>> {
        self.build_time.detect(image, filters)
    }

    /// Deploy-time check of one deployment: detect, reconcile against its
    /// stored DEPLOY alerts, and pick the enforcement action.
    pub async fn check_deployment(
        &self,
        action: ResourceAction,
        deployment: &Deployment,
        images: &[Image],
    ) -> Result<DeploymentVerdict> {
        let alerts = self
            .deploy_time
            .detect(DeployContext::new(action), deployment, images)?;
        let enforcement = resolve_enforcement(&alerts);
        let query = AlertQuery::for_entity(&deployment.id).with_stage(LifecycleStage::Deploy);
        let diff = self.alerts.reconcile(&query, alerts.clone()).await?;
        debug!(
            deployment_id = %deployment.id,
            alerts = alerts.len(),
            enforcement = ?enforcement.as_ref().map(|e| e.action),
            "deployment checked"
        );
        Ok(DeploymentVerdict {
            alerts,
            enforcement,
            diff,
        })
    }

    /// Runtime check of one process event.
    ///
    /// Only alerts for the violated policies are reconciled; a process event
    /// never retires earlier runtime alerts.
    pub async fn process_indicator(
        &self,
        deployment: &Deployment,
        images: &[Image],
        indicator: &ProcessIndicator,
    ) -> Result<AlertDiff> {
        let current = self.runtime.detect_process(deployment, images, indicator)?;
        if current.is_empty() {
            return Ok(AlertDiff::default());
        }
        let violated: HashSet<&str> = current.iter().map(|a| a.policy_id()).collect();
        let query = AlertQuery::for_entity(&deployment.id).with_stage(LifecycleStage::Runtime);
        let previous: Vec<Alert> = self
            .alerts
            .store()
            .search_raw_alerts(&query)
            .await?
            .into_iter()
            .filter(|a| violated.contains(a.policy_id()))
            .collect();
        self.alerts.alert_and_notify(previous, current).await
    }

    /// Every deployment in the fleet currently violating `policy_id`.
    pub async fn alerts_for_policy(&self, policy_id: &str) -> Result<Vec<Alert>> {
        self.deploy_time.alerts_for_policy(policy_id).await
    }

    /// Keep the durable index in step with a deployment change and queue a
    /// reprocessing task for it. Waits while the queue is full.
    pub async fn deployment_changed(
        &self,
        action: ResourceAction,
        deployment: &Deployment,
        images: &[Image],
    ) -> Result<()> {
        match action {
            ResourceAction::Remove => self.indexer.remove_deployment(&deployment.id),
            ResourceAction::Create | ResourceAction::Update => {
                self.indexer.index_deployment(deployment, images)
            }
        }
        self.reprocessor
            .enqueue(Task::new(&deployment.id, action))
            .await
    }

    /// Stop background work, letting queued tasks finish.
    pub async fn shutdown(&self) {
        self.reprocessor.stop().await;
    }
}
