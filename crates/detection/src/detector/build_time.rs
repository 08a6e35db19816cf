use std::sync::Arc;

use tracing::debug;

use stackwatch_core::{Alert, EnforcementAction, Image, LifecycleStage};

use super::{is_candidate, new_alert, Executor};
use crate::category::PolicyFilter;
use crate::combinators::MatchCache;
use crate::compiler::CompiledPolicy;
use crate::enforcement::enforcement_for;
use crate::entity::EntityRef;
use crate::error::Result;
use crate::policy_set::PolicySet;

/// Evaluates BUILD-stage policies against an image.
pub struct BuildTimeDetector {
    policy_set: Arc<PolicySet>,
}

impl BuildTimeDetector {
    pub fn new(policy_set: Arc<PolicySet>) -> Self {
        Self { policy_set }
    }

    /// Alerts for every BUILD policy `image` violates.
    ///
    /// A policy takes part only if every filter allows it.
    pub fn detect(&self, image: &Image, filters: &[&dyn PolicyFilter]) -> Result<Vec<Alert>> {
        let mut executor = ImageExecutor {
            image,
            filters,
            cache: MatchCache::new(),
            alerts: Vec::new(),
        };
        self.policy_set.for_each(&mut executor)?;
        debug!(image = %image.name, alerts = executor.alerts.len(), "build-time detection done");
        Ok(executor.take_alerts())
    }
}

struct ImageExecutor<'a> {
    image: &'a Image,
    filters: &'a [&'a dyn PolicyFilter],
    cache: MatchCache,
    alerts: Vec<Alert>,
}

impl Executor for ImageExecutor<'_> {
    fn execute(&mut self, compiled: &CompiledPolicy) -> Result<()> {
        if !is_candidate(compiled, LifecycleStage::Build) {
            return Ok(());
        }
        let policy = compiled.policy();
        if !self.filters.iter().all(|f| f.allows(policy)) {
            return Ok(());
        }
        let entity = EntityRef::Image(self.image);
        if !compiled.applies_to(&entity) {
            return Ok(());
        }
        let violations = compiled.violations(&entity, &mut self.cache)?;
        if violations.is_empty() {
            return Ok(());
        }

        let mut alert = new_alert(LifecycleStage::Build, compiled, &entity, violations);
        if policy.has_enforcement(EnforcementAction::FailBuild) {
            alert.enforcement =
                enforcement_for(EnforcementAction::FailBuild, &self.image.name.to_string());
        }
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
