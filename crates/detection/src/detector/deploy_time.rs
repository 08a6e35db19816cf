use std::sync::Arc;

use tracing::debug;

use stackwatch_core::{Alert, Deployment, Image, LifecycleStage, ResourceAction};

use super::{is_candidate, new_alert, Executor};
use crate::combinators::MatchCache;
use crate::compiler::CompiledPolicy;
use crate::enforcement::{determine_action, enforcement_for};
use crate::entity::EntityRef;
use crate::error::{DetectionError, Result};
use crate::policy_set::PolicySet;
use crate::search::{MemoryIndex, Searcher};
use crate::store::EntityStore;

/// What triggered a deploy-time detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployContext {
    pub action: ResourceAction,
}

impl DeployContext {
    pub fn new(action: ResourceAction) -> Self {
        Self { action }
    }
}

/// Evaluates DEPLOY-stage policies against deployments.
pub struct DeployTimeDetector {
    policy_set: Arc<PolicySet>,
    searcher: Arc<dyn Searcher>,
    entities: Arc<dyn EntityStore>,
    scale_to_zero_enabled: bool,
}

impl DeployTimeDetector {
    pub fn new(
        policy_set: Arc<PolicySet>,
        searcher: Arc<dyn Searcher>,
        entities: Arc<dyn EntityStore>,
        scale_to_zero_enabled: bool,
    ) -> Self {
        Self {
            policy_set,
            searcher,
            entities,
            scale_to_zero_enabled,
        }
    }

    /// Alerts for every DEPLOY policy `deployment` violates.
    ///
    /// Index-backed candidacy is answered by a throw-away index holding just
    /// this deployment.
    pub fn detect(
        &self,
        ctx: DeployContext,
        deployment: &Deployment,
        images: &[Image],
    ) -> Result<Vec<Alert>> {
        let mut executor = self.executor(ctx, deployment, images);
        self.policy_set.for_each(&mut executor)?;
        debug!(deployment_id = %deployment.id, alerts = executor.alerts.len(), "deploy-time detection done");
        Ok(executor.take_alerts())
    }

    /// Like [`detect`](Self::detect), restricted to one policy.
    pub fn detect_for_policy(
        &self,
        ctx: DeployContext,
        deployment: &Deployment,
        images: &[Image],
        policy_id: &str,
    ) -> Result<Vec<Alert>> {
        let mut executor = self.executor(ctx, deployment, images);
        self.policy_set.for_one(policy_id, &mut executor)?;
        Ok(executor.take_alerts())
    }

    fn executor<'a>(
        &self,
        ctx: DeployContext,
        deployment: &'a Deployment,
        images: &'a [Image],
    ) -> DeploymentExecutor<'a> {
        DeploymentExecutor {
            ctx,
            deployment,
            images,
            index: MemoryIndex::for_deployment(deployment, images),
            scale_to_zero_enabled: self.scale_to_zero_enabled,
            cache: MatchCache::new(),
            alerts: Vec::new(),
        }
    }

    /// Alerts for every deployment in the fleet that violates one policy.
    ///
    /// Index hits are candidates only; each is loaded and re-checked against
    /// the full predicate and matcher.
    pub async fn alerts_for_policy(&self, policy_id: &str) -> Result<Vec<Alert>> {
        let compiled = self
            .policy_set
            .get(policy_id)
            .ok_or_else(|| DetectionError::PolicyNotFound(policy_id.to_string()))?;
        if !is_candidate(&compiled, LifecycleStage::Deploy) {
            return Ok(Vec::new());
        }
        let policy = compiled.policy();
        let candidates = self
            .searcher
            .search(compiled.query())
            .map_err(|e| e.in_match(&policy.name, "deployment index"))?;

        let mut cache = MatchCache::new();
        let mut alerts = Vec::new();
        for id in candidates {
            let Some(deployment) = self.entities.get_deployment(&id).await? else {
                debug!(deployment_id = %id, "index hit for unknown deployment");
                continue;
            };
            let images = self.entities.get_images(&deployment).await?;
            let entity = EntityRef::Deployment {
                deployment: &deployment,
                images: &images,
            };
            if !compiled.applies_to(&entity) {
                continue;
            }
            let violations = compiled.violations(&entity, &mut cache)?;
            if violations.is_empty() {
                continue;
            }
            let mut alert = new_alert(LifecycleStage::Deploy, &compiled, &entity, violations);
            let action = determine_action(
                policy,
                ResourceAction::Update,
                &deployment.deployment_type,
                self.scale_to_zero_enabled,
            );
            alert.enforcement = enforcement_for(action, &deployment.name);
            alerts.push(alert);
        }
        debug!(policy_id, alerts = alerts.len(), "fleet detection for policy done");
        Ok(alerts)
    }
}

struct DeploymentExecutor<'a> {
    ctx: DeployContext,
    deployment: &'a Deployment,
    images: &'a [Image],
    index: MemoryIndex,
    scale_to_zero_enabled: bool,
    cache: MatchCache,
    alerts: Vec<Alert>,
}

impl Executor for DeploymentExecutor<'_> {
    fn execute(&mut self, compiled: &CompiledPolicy) -> Result<()> {
        if !is_candidate(compiled, LifecycleStage::Deploy) {
            return Ok(());
        }
        let policy = compiled.policy();
        let entity = EntityRef::Deployment {
            deployment: self.deployment,
            images: self.images,
        };
        if !compiled.applies_to(&entity) {
            return Ok(());
        }
        if !compiled.query().is_empty() {
            let hits = self
                .index
                .search(compiled.query())
                .map_err(|e| e.in_match(&policy.name, &entity.describe()))?;
            if !hits.iter().any(|id| id == &self.deployment.id) {
                return Ok(());
            }
        }

        let violations = compiled.violations(&entity, &mut self.cache)?;
        if violations.is_empty() {
            return Ok(());
        }
        let mut alert = new_alert(LifecycleStage::Deploy, compiled, &entity, violations);
        let action = determine_action(
            policy,
            self.ctx.action,
            &self.deployment.deployment_type,
            self.scale_to_zero_enabled,
        );
        alert.enforcement = enforcement_for(action, &self.deployment.name);
        self.alerts.push(alert);
        Ok(())
    }

    fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    fn clear_alerts(&mut self) {
        self.alerts.clear();
    }
}
