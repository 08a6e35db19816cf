//! Detectors: run compiled policies against one entity shape.
//!
//! Each detector drives a short-lived [`Executor`] through the policy set and
//! collects the alerts it produces.

mod build_time;
mod deploy_time;
mod runtime;

pub use build_time::BuildTimeDetector;
pub use deploy_time::{DeployContext, DeployTimeDetector};
pub use runtime::RuntimeDetector;

use stackwatch_core::{Alert, LifecycleStage, Violation};

use crate::compiler::CompiledPolicy;
use crate::entity::EntityRef;
use crate::error::Result;

/// Visitor run by the policy set over compiled policies.
pub trait Executor {
    fn execute(&mut self, compiled: &CompiledPolicy) -> Result<()>;

    /// Alerts accumulated so far.
    fn alerts(&self) -> &[Alert];

    fn clear_alerts(&mut self);

    fn take_alerts(&mut self) -> Vec<Alert> {
        let alerts = self.alerts().to_vec();
        self.clear_alerts();
        alerts
    }
}

/// Whether `compiled` takes part in a detection pass at `stage` at all.
fn is_candidate(compiled: &CompiledPolicy, stage: LifecycleStage) -> bool {
    let policy = compiled.policy();
    !policy.disabled && policy.applies_at(stage)
}

fn new_alert(
    stage: LifecycleStage,
    compiled: &CompiledPolicy,
    entity: &EntityRef<'_>,
    violations: Vec<Violation>,
) -> Alert {
    Alert::new(stage, compiled.policy(), entity.to_alert_entity(), violations)
}
