use std::sync::Arc;

use stackwatch_core::{Alert, Deployment, EnforcementAction, Image, LifecycleStage, ProcessIndicator};

use super::{is_candidate, new_alert, Executor};
use crate::combinators::MatchCache;
use crate::compiler::CompiledPolicy;
use crate::enforcement::enforcement_for;
use crate::entity::EntityRef;
use crate::error::Result;
use crate::policy_set::PolicySet;

/// Evaluates RUNTIME-stage policies against process events.
pub struct RuntimeDetector {
    policy_set: Arc<PolicySet>,
}

impl RuntimeDetector {
    pub fn new(policy_set: Arc<PolicySet>) -> Self {
        Self { policy_set }
    }

    /// Alerts for every RUNTIME policy the process event violates. Each alert
    /// carries the offending process.
    pub fn detect_process(
        &self,
        deployment: &Deployment,
        images: &[Image],
        indicator: &ProcessIndicator,
    ) -> Result<Vec<Alert>> {
        let mut executor = ProcessExecutor {
            entity: EntityRef::Process {
                deployment,
                images,
                indicator,
            },
            cache: MatchCache::new(),
            alerts: Vec::new(),
        };
        self.policy_set.for_each(&mut executor)?;
        Ok(executor.take_alerts())
    }
}

struct ProcessExecutor<'a> {
    entity: EntityRef<'a>,
    cache: MatchCache,
    alerts: Vec<Alert>,
}

impl Executor for ProcessExecutor<'_> {
    fn execute(&mut self, compiled: &CompiledPolicy) -> Result<()> {
        if !is_candidate(compiled, LifecycleStage::Runtime) || !compiled.applies_to(&self.entity) {
            return Ok(());
        }
        let violations = compiled.violations(&self.entity, &mut self.cache)?;
        if violations.is_empty() {
            return Ok(());
        }
        let mut alert = new_alert(LifecycleStage::Runtime, compiled, &self.entity, violations);
        if let Some(indicator) = self.entity.indicator() {
            alert.processes.push(indicator.clone());
        }
        if compiled.policy().has_enforcement(EnforcementAction::KillPod) {
            let name = self.entity.deployment().map(|d| d.name.as_str()).unwrap_or_default();
            alert.enforcement = enforcement_for(EnforcementAction::KillPod, name);
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

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use stackwatch_core::{ImageName, Policy};

    use super::*;
    use crate::memory::MemoryPolicyStore;

    const SHELL: &str = r#"
id: shell
name: Shell spawned
lifecycleStages: [RUNTIME]
fields: { processPolicy: { name: "^(bash|sh)$" } }
enforcementActions: [KILL_POD]
"#;

    #[test]
    fn process_alert_carries_the_process() {
        let set = Arc::new(PolicySet::new(Arc::new(MemoryPolicyStore::new())));
        let policy: Policy = serde_yaml::from_str(SHELL).unwrap();
        set.upsert_policy(&policy).unwrap();
        let detector = RuntimeDetector::new(set);

        let deployment: Deployment = serde_json::from_value(json!({
            "id": "d1",
            "name": "web",
            "containers": [{ "name": "main", "image": { "name": ImageName::parse("nginx") } }]
        }))
        .unwrap();
        let indicator = |name: &str| -> ProcessIndicator {
            serde_json::from_value(json!({
                "id": format!("proc-{name}"),
                "deploymentId": "d1",
                "containerName": "main",
                "signal": { "name": name, "execFilePath": format!("/bin/{name}"), "time": Utc::now() }
            }))
            .unwrap()
        };

        assert!(detector.detect_process(&deployment, &[], &indicator("nginx")).unwrap().is_empty());

        let alerts = detector.detect_process(&deployment, &[], &indicator("bash")).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].lifecycle_stage, LifecycleStage::Runtime);
        assert_eq!(alerts[0].processes.len(), 1);
        assert_eq!(alerts[0].processes[0].id, "proc-bash");
        assert_eq!(alerts[0].enforcement_action(), EnforcementAction::KillPod);
    }
}
