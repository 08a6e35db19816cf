//! Enforcement action selection.

use stackwatch_core::{Alert, Enforcement, EnforcementAction, Policy, ResourceAction};

/// Workload kinds that are never scaled down automatically.
const UNSCALABLE_TYPES: &[&str] = &["Global", "DaemonSet"];

/// Action `policy` requests for one deployment-time violation.
///
/// Scale-to-zero only applies on creation, when enabled, and never to
/// unscalable workload kinds; otherwise a node constraint is used if the
/// policy asks for one.
pub fn determine_action(
    policy: &Policy,
    action: ResourceAction,
    deployment_type: &str,
    scale_to_zero_enabled: bool,
) -> EnforcementAction {
    let scalable = !UNSCALABLE_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(deployment_type));
    if policy.has_enforcement(EnforcementAction::ScaleToZero)
        && action == ResourceAction::Create
        && scale_to_zero_enabled
        && scalable
    {
        return EnforcementAction::ScaleToZero;
    }
    if policy.has_enforcement(EnforcementAction::UnsatisfiableNodeConstraint) {
        return EnforcementAction::UnsatisfiableNodeConstraint;
    }
    EnforcementAction::Unset
}

/// Pick one action from the actions of all policies violated in one pass.
///
/// Scale-to-zero wins outright; otherwise the last non-unset action counts.
pub fn resolve_action<I>(actions: I) -> EnforcementAction
where
    I: IntoIterator<Item = EnforcementAction>,
{
    let mut resolved = EnforcementAction::Unset;
    for action in actions {
        match action {
            EnforcementAction::ScaleToZero => return EnforcementAction::ScaleToZero,
            EnforcementAction::Unset => {}
            other => resolved = other,
        }
    }
    resolved
}

/// The single enforcement to apply to an entity given its alerts, if any.
pub fn resolve_enforcement(alerts: &[Alert]) -> Option<Enforcement> {
    let action = resolve_action(alerts.iter().map(Alert::enforcement_action));
    if action == EnforcementAction::Unset {
        return None;
    }
    let alert = alerts.iter().find(|a| a.enforcement_action() == action)?;
    enforcement_for(action, &alert.entity.name())
}

/// Human-readable description of `action` carried out on `entity_name`.
pub fn enforcement_message(action: EnforcementAction, entity_name: &str) -> String {
    match action {
        EnforcementAction::ScaleToZero => format!(
            "Deployment {entity_name} scaled to 0 replicas in response to policy violation"
        ),
        EnforcementAction::UnsatisfiableNodeConstraint => format!(
            "Unsatisfiable node constraint applied to deployment {entity_name} in response to policy violation"
        ),
        EnforcementAction::KillPod => {
            format!("Pod of deployment {entity_name} killed in response to policy violation")
        }
        EnforcementAction::FailBuild => {
            format!("Build of image {entity_name} failed in response to policy violation")
        }
        EnforcementAction::Unset => String::new(),
    }
}

/// `Some` enforcement for a non-unset action.
pub fn enforcement_for(action: EnforcementAction, entity_name: &str) -> Option<Enforcement> {
    (action != EnforcementAction::Unset).then(|| Enforcement {
        action,
        message: enforcement_message(action, entity_name),
    })
}
