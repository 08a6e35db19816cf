//! In-memory collaborators.
//!
//! Back the worker binary when no external stores are configured and serve
//! as fixtures for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use stackwatch_core::{Alert, Deployment, Image, Policy, Result, StackwatchError};

use crate::store::{AlertQuery, AlertStore, EntityStore, Notifier, PolicyStore};

// ── Policies ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<BTreeMap<String, Policy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: impl IntoIterator<Item = Policy>) -> Self {
        let store = Self::new();
        for policy in policies {
            store.put(policy);
        }
        store
    }

    pub fn put(&self, policy: Policy) {
        self.policies
            .write()
            .expect("policy store lock poisoned")
            .insert(policy.id.clone(), policy);
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies
            .read()
            .expect("policy store lock poisoned")
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get_policies(&self) -> Result<Vec<Policy>> {
        Ok(self
            .policies
            .read()
            .expect("policy store lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<()> {
        self.put(policy.clone());
        Ok(())
    }
}

// ── Alerts ──────────────────────────────────────────────────────────

/// Alerts keyed by alert id.
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<BTreeMap<String, Alert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.alerts
            .read()
            .expect("alert store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Every stored alert, stale ones included.
    pub fn all(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .expect("alert store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.read().expect("alert store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn search_raw_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        Ok(self
            .alerts
            .read()
            .expect("alert store lock poisoned")
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect())
    }

    async fn add_alert(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().expect("alert store lock poisoned");
        if alerts.contains_key(&alert.id) {
            return Err(StackwatchError::Store(format!(
                "alert {} already exists",
                alert.id
            )));
        }
        alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn update_alert(&self, alert: &Alert) -> Result<()> {
        let mut alerts = self.alerts.write().expect("alert store lock poisoned");
        match alerts.get_mut(&alert.id) {
            Some(existing) => {
                *existing = alert.clone();
                Ok(())
            }
            None => Err(StackwatchError::NotFound {
                kind: "alert",
                id: alert.id.clone(),
            }),
        }
    }
}

// ── Entities ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    deployments: RwLock<BTreeMap<String, Deployment>>,
    images: RwLock<HashMap<String, Image>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_deployment(&self, deployment: Deployment) {
        self.deployments
            .write()
            .expect("deployment store lock poisoned")
            .insert(deployment.id.clone(), deployment);
    }

    pub fn remove_deployment(&self, id: &str) -> Option<Deployment> {
        self.deployments
            .write()
            .expect("deployment store lock poisoned")
            .remove(id)
    }

    pub fn upsert_image(&self, image: Image) {
        self.images
            .write()
            .expect("image store lock poisoned")
            .insert(image.id.clone(), image);
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self
            .deployments
            .read()
            .expect("deployment store lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        Ok(self
            .deployments
            .read()
            .expect("deployment store lock poisoned")
            .get(id)
            .cloned())
    }

    async fn get_images(&self, deployment: &Deployment) -> Result<Vec<Image>> {
        let images = self.images.read().expect("image store lock poisoned");
        let mut found: Vec<Image> = Vec::new();
        for container in &deployment.containers {
            let by_id = container.image.id.as_deref().and_then(|id| images.get(id));
            let image = by_id.or_else(|| {
                images
                    .values()
                    .find(|i| i.name.full_name == container.image.name.full_name)
            });
            if let Some(image) = image {
                if !found.iter().any(|f| f.id == image.id) {
                    found.push(image.clone());
                }
            }
        }
        Ok(found)
    }
}

// ── Notifiers ───────────────────────────────────────────────────────

/// Keeps every alert it is handed.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("notifier lock poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().expect("notifier lock poisoned").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn process_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .expect("notifier lock poisoned")
            .push(alert.clone());
        Ok(())
    }
}

/// Writes each new alert to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn process_alert(&self, alert: &Alert) -> Result<()> {
        tracing::warn!(
            alert_id = %alert.id,
            policy = %alert.policy.name,
            entity = %alert.entity.name(),
            stage = %alert.lifecycle_stage,
            violations = alert.violations.len(),
            "Policy violation"
        );
        Ok(())
    }
}
