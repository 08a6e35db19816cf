use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of mutation that triggered a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceAction {
    Create,
    Update,
    Remove,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAction::Create => write!(f, "create"),
            ResourceAction::Update => write!(f, "update"),
            ResourceAction::Remove => write!(f, "remove"),
        }
    }
}

/// RBAC permission level of a deployment's service account, ordered from
/// least to most privileged.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    #[default]
    None,
    Default,
    ElevatedInNamespace,
    ElevatedClusterWide,
    ClusterAdmin,
}

// ── Images ────────────────────────────────────────────────────

/// A parsed image reference (`registry/remote:tag`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageName {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub full_name: String,
}

impl ImageName {
    /// Parse a reference such as `docker.io/library/nginx:1.25`.
    ///
    /// A missing registry defaults to `docker.io`, a missing tag to `latest`.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let (without_digest, _) = reference.split_once('@').unwrap_or((reference, ""));

        let (registry, rest) = match without_digest.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => ("docker.io".to_string(), without_digest.to_string()),
        };

        // A ':' after the last '/' separates the tag.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (remote, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (
                rest[..last_slash + i].to_string(),
                rest[last_slash + i + 1..].to_string(),
            ),
            None => (rest.clone(), "latest".to_string()),
        };

        let remote = if registry == "docker.io" && !remote.contains('/') {
            format!("library/{remote}")
        } else {
            remote
        };

        Self {
            full_name: format!("{registry}/{remote}:{tag}"),
            registry,
            remote,
            tag,
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.full_name.is_empty() {
            write!(f, "{}/{}:{}", self.registry, self.remote, self.tag)
        } else {
            write!(f, "{}", self.full_name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub cve: String,
    #[serde(default)]
    pub cvss: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageComponent {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub vulns: Vec<Vulnerability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageScan {
    pub scan_time: DateTime<Utc>,
    #[serde(default)]
    pub components: Vec<ImageComponent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<String>,
}

/// A container image with optional build metadata and scan results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    pub name: ImageName,
    #[serde(default)]
    pub metadata: Option<ImageMetadata>,
    #[serde(default)]
    pub scan: Option<ImageScan>,
}

impl Image {
    /// An image known only by its reference, without metadata or scan.
    pub fn from_name(id: impl Into<String>, name: ImageName) -> Self {
        Self {
            id: id.into(),
            name,
            metadata: None,
            scan: None,
        }
    }

    /// Highest CVSS score over all scanned vulnerabilities, if scanned.
    pub fn max_cvss(&self) -> Option<f32> {
        let scan = self.scan.as_ref()?;
        scan.components
            .iter()
            .flat_map(|c| c.vulns.iter())
            .map(|v| v.cvss)
            .fold(None, |acc: Option<f32>, cvss| {
                Some(acc.map_or(cvss, |m| m.max(cvss)))
            })
    }
}

// ── Deployments ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    #[serde(default)]
    pub id: Option<String>,
    pub name: ImageName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    #[serde(default)]
    pub add_capabilities: Vec<String>,
    #[serde(default)]
    pub drop_capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub container_port: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, rename = "type")]
    pub volume_type: String,
}

/// Requested and limited resources; CPU in cores, memory in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default)]
    pub cpu_cores_request: f32,
    #[serde(default)]
    pub cpu_cores_limit: f32,
    #[serde(default)]
    pub memory_mb_request: f32,
    #[serde(default)]
    pub memory_mb_limit: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: ContainerImage,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub security_context: SecurityContext,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub resources: Resources,
}

/// A Kubernetes workload as seen by the detection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
    /// Workload kind: `Deployment`, `DaemonSet`, `StatefulSet`, `Global`, ...
    #[serde(default = "default_deployment_type", rename = "type")]
    pub deployment_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub service_account_permission_level: PermissionLevel,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub inactive: bool,
}

fn default_deployment_type() -> String {
    "Deployment".to_string()
}

impl Deployment {
    /// Image ids referenced by this deployment's containers, in container order.
    pub fn image_ids(&self) -> Vec<&str> {
        self.containers
            .iter()
            .filter_map(|c| c.image.id.as_deref())
            .collect()
    }
}

// ── Runtime events ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSignal {
    pub name: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub exec_file_path: String,
    #[serde(default)]
    pub uid: u32,
    pub time: DateTime<Utc>,
    /// Executable paths of the parent process chain, closest first.
    #[serde(default)]
    pub lineage: Vec<String>,
}

/// A process execution observed inside a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIndicator {
    pub id: String,
    pub deployment_id: String,
    #[serde(default)]
    pub container_name: String,
    pub signal: ProcessSignal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_docker_hub_short_name() {
        let name = ImageName::parse("nginx");
        assert_eq!(name.registry, "docker.io");
        assert_eq!(name.remote, "library/nginx");
        assert_eq!(name.tag, "latest");
        assert_eq!(name.full_name, "docker.io/library/nginx:latest");
    }

    #[test]
    fn parse_registry_with_port_and_tag() {
        let name = ImageName::parse("registry.local:5000/team/api:1.4.2");
        assert_eq!(name.registry, "registry.local:5000");
        assert_eq!(name.remote, "team/api");
        assert_eq!(name.tag, "1.4.2");
    }

    #[test]
    fn parse_ignores_digest() {
        let name = ImageName::parse("quay.io/org/app:v1@sha256:abc");
        assert_eq!(name.registry, "quay.io");
        assert_eq!(name.remote, "org/app");
        assert_eq!(name.tag, "v1");
    }

    #[test]
    fn max_cvss_over_components() {
        let image = Image {
            id: "sha256:1".to_string(),
            name: ImageName::parse("nginx:1.25"),
            metadata: None,
            scan: Some(ImageScan {
                scan_time: Utc::now(),
                components: vec![
                    ImageComponent {
                        name: "openssl".to_string(),
                        version: "1.1.1".to_string(),
                        vulns: vec![Vulnerability {
                            cve: "CVE-2022-0778".to_string(),
                            cvss: 7.5,
                        }],
                    },
                    ImageComponent {
                        name: "bash".to_string(),
                        version: "5.1".to_string(),
                        vulns: vec![],
                    },
                ],
            }),
        };
        assert_eq!(image.max_cvss(), Some(7.5));
        assert_eq!(Image::default().max_cvss(), None);
    }

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::ClusterAdmin > PermissionLevel::ElevatedClusterWide);
        assert!(PermissionLevel::Default > PermissionLevel::None);
    }
}
