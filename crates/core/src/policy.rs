//! Policy documents: criteria, scopes, exclusions and enforcement.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::PermissionLevel;

/// When a policy is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStage {
    Build,
    Deploy,
    Runtime,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStage::Build => write!(f, "BUILD"),
            LifecycleStage::Deploy => write!(f, "DEPLOY"),
            LifecycleStage::Runtime => write!(f, "RUNTIME"),
        }
    }
}

/// Automated remedial actions a policy may request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    #[default]
    Unset,
    ScaleToZero,
    UnsatisfiableNodeConstraint,
    KillPod,
    FailBuild,
}

impl EnforcementAction {
    /// Lifecycle stage at which this action can be carried out.
    pub fn stage(&self) -> Option<LifecycleStage> {
        match self {
            EnforcementAction::Unset => None,
            EnforcementAction::ScaleToZero | EnforcementAction::UnsatisfiableNodeConstraint => {
                Some(LifecycleStage::Deploy)
            }
            EnforcementAction::KillPod => Some(LifecycleStage::Runtime),
            EnforcementAction::FailBuild => Some(LifecycleStage::Build),
        }
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementAction::Unset => write!(f, "UNSET"),
            EnforcementAction::ScaleToZero => write!(f, "SCALE_TO_ZERO"),
            EnforcementAction::UnsatisfiableNodeConstraint => {
                write!(f, "UNSATISFIABLE_NODE_CONSTRAINT")
            }
            EnforcementAction::KillPod => write!(f, "KILL_POD"),
            EnforcementAction::FailBuild => write!(f, "FAIL_BUILD"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

// ── Criteria ──────────────────────────────────────────────────

/// Numeric comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparator {
    pub fn matches(&self, value: f32, threshold: f32) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Gte => value >= threshold,
            Comparator::Lt => value < threshold,
            Comparator::Lte => value <= threshold,
            Comparator::Eq => (value - threshold).abs() <= f32::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Eq => "=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NumericalPolicy {
    pub op: Comparator,
    pub value: f32,
}

/// Regex criteria on the parts of an image reference. Absent parts match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageNamePolicy {
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyValuePolicy {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentPolicy {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct VolumePolicy {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default, rename = "type")]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortPolicy {
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResourcePolicy {
    #[serde(default)]
    pub cpu_request: Option<NumericalPolicy>,
    #[serde(default)]
    pub cpu_limit: Option<NumericalPolicy>,
    #[serde(default)]
    pub memory_request: Option<NumericalPolicy>,
    #[serde(default)]
    pub memory_limit: Option<NumericalPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PermissionPolicy {
    pub permission_level: PermissionLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessPolicy {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub ancestor: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
}

/// Field criteria of a policy. Every criterion present must be violated
/// for the policy to be violated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PolicyFields {
    #[serde(default)]
    pub image_name: Option<ImageNamePolicy>,
    #[serde(default)]
    pub image_age_days: Option<i64>,
    #[serde(default)]
    pub scan_age_days: Option<i64>,
    #[serde(default)]
    pub unscanned_image: Option<bool>,
    #[serde(default)]
    pub cvss: Option<NumericalPolicy>,
    #[serde(default)]
    pub cve: Option<String>,
    #[serde(default)]
    pub component: Option<ComponentPolicy>,
    #[serde(default)]
    pub env: Option<KeyValuePolicy>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub volume_policy: Option<VolumePolicy>,
    #[serde(default)]
    pub port_policy: Option<PortPolicy>,
    #[serde(default)]
    pub required_label: Option<KeyValuePolicy>,
    #[serde(default)]
    pub required_annotation: Option<KeyValuePolicy>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub read_only_root_fs: Option<bool>,
    #[serde(default)]
    pub add_capabilities: Vec<String>,
    #[serde(default)]
    pub drop_capabilities: Vec<String>,
    #[serde(default)]
    pub container_resources: Option<ResourcePolicy>,
    #[serde(default)]
    pub permission_policy: Option<PermissionPolicy>,
    #[serde(default)]
    pub process_policy: Option<ProcessPolicy>,
}

// ── Scopes and exclusions ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelSelector {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Cluster / namespace / label selector. Empty parts match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scope {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub label: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentExclusion {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageExclusion {
    /// Prefix of the full image name.
    pub name: String,
}

/// A time-bounded exclusion suppressing a policy for matching entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Whitelist {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub deployment: Option<DeploymentExclusion>,
    #[serde(default)]
    pub image: Option<ImageExclusion>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl Whitelist {
    /// Whether the exclusion is still in force at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(true, |exp| exp > now)
    }
}

// ── Policy ────────────────────────────────────────────────────

/// A user-authored security policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub lifecycle_stages: Vec<LifecycleStage>,
    #[serde(default)]
    pub fields: PolicyFields,
    #[serde(default)]
    pub scope: Vec<Scope>,
    #[serde(default)]
    pub whitelists: Vec<Whitelist>,
    #[serde(default)]
    pub enforcement_actions: Vec<EnforcementAction>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub notifiers: Vec<String>,
}

impl Policy {
    pub fn applies_at(&self, stage: LifecycleStage) -> bool {
        self.lifecycle_stages.contains(&stage)
    }

    pub fn has_enforcement(&self, action: EnforcementAction) -> bool {
        self.enforcement_actions.contains(&action)
    }

    /// Case-insensitive category membership.
    pub fn has_category(&self, category: &str) -> bool {
        self.categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
id: latest-tag
name: Latest tag
categories: [DevOps Best Practices]
lifecycleStages: [BUILD, DEPLOY]
fields:
  imageName:
    tag: "^latest$"
  privileged: true
scope:
  - namespace: prod
whitelists:
  - name: kube-system
    deployment:
      scope:
        namespace: kube-system
enforcementActions: [SCALE_TO_ZERO]
"#;

    #[test]
    fn parse_policy_document() {
        let policy: Policy = serde_yaml::from_str(POLICY_YAML).unwrap();
        assert_eq!(policy.id, "latest-tag");
        assert!(policy.applies_at(LifecycleStage::Build));
        assert!(!policy.applies_at(LifecycleStage::Runtime));
        assert_eq!(
            policy.fields.image_name.as_ref().unwrap().tag.as_deref(),
            Some("^latest$")
        );
        assert_eq!(policy.fields.privileged, Some(true));
        assert!(policy.has_enforcement(EnforcementAction::ScaleToZero));
        assert!(policy.has_category("devops best practices"));
        assert!(!policy.disabled);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "id: x\nname: x\nbogus: true\n";
        assert!(serde_yaml::from_str::<Policy>(yaml).is_err());
    }

    #[test]
    fn whitelist_expiration() {
        let now = Utc::now();
        let expired = Whitelist {
            expiration: Some(now - chrono::Duration::hours(1)),
            ..Default::default()
        };
        let open_ended = Whitelist::default();
        assert!(!expired.is_active(now));
        assert!(open_ended.is_active(now));
    }

    #[test]
    fn comparator_semantics() {
        assert!(Comparator::Gte.matches(7.0, 7.0));
        assert!(!Comparator::Gt.matches(7.0, 7.0));
        assert!(Comparator::Lt.matches(0.1, 0.5));
    }
}
