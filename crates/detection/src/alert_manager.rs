//! Alert reconciliation.
//!
//! Re-detection produces a fresh alert set every time. Diffing it against the
//! alerts already stored turns that into new, updated and stale alerts while
//! keeping alert identity and age stable across passes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use stackwatch_core::{Alert, AlertKey, LifecycleStage};

use crate::error::{ErrorList, Result};
use crate::store::{AlertQuery, AlertStore, Notifier};

/// Upper bound on processes kept on one runtime alert.
pub const MAX_PROCESSES_PER_ALERT: usize = 40;

/// Classification of a current alert set against the previous one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertDiff {
    pub new: Vec<Alert>,
    pub updated: Vec<Alert>,
    pub stale: Vec<Alert>,
}

impl AlertDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.stale.is_empty()
    }
}

/// Diff `current` against `previous`, keyed by (policy id, entity id).
///
/// - only in `current`: new, `first_occurred = now`;
/// - in both: updated, carrying the previous id, first occurrence and
///   enforcement (unless a new one was computed); unchanged alerts are
///   dropped from the diff;
/// - only in `previous`: stale, `marked_stale = now`.
///
/// Duplicate previous alerts for one key are marked stale as well.
pub fn merge_alerts(previous: &[Alert], current: Vec<Alert>, now: DateTime<Utc>) -> AlertDiff {
    let mut diff = AlertDiff::default();

    let mut by_key: HashMap<AlertKey, &Alert> = HashMap::new();
    let mut duplicates: Vec<&Alert> = Vec::new();
    for alert in previous {
        if by_key.contains_key(&alert.key()) {
            duplicates.push(alert);
        } else {
            by_key.insert(alert.key(), alert);
        }
    }

    let mut seen: HashSet<AlertKey> = HashSet::new();
    for mut alert in current {
        let key = alert.key();
        if !seen.insert(key.clone()) {
            warn!(policy_id = %key.policy_id, entity_id = %key.entity_id, "duplicate alert in one pass, ignoring");
            continue;
        }
        match by_key.get(&key) {
            Some(old) => {
                if let Some(merged) = merge_pair(old, alert) {
                    diff.updated.push(merged);
                }
            }
            None => {
                alert.first_occurred = Some(now);
                diff.new.push(alert);
            }
        }
    }

    let leftovers = by_key
        .into_iter()
        .filter(|(key, _)| !seen.contains(key))
        .map(|(_, alert)| alert);
    let mut stale: Vec<Alert> = leftovers
        .chain(duplicates)
        .map(|alert| {
            let mut alert = alert.clone();
            alert.stale = true;
            alert.marked_stale = Some(now);
            alert
        })
        .collect();
    stale.sort_by(|a, b| a.key().cmp(&b.key()).then_with(|| a.id.cmp(&b.id)));
    diff.stale = stale;
    diff
}

/// Merge one current alert onto its previous instance. `None` when the
/// result is identical to what is stored.
fn merge_pair(old: &Alert, mut alert: Alert) -> Option<Alert> {
    let runtime = old.lifecycle_stage == LifecycleStage::Runtime
        && alert.lifecycle_stage == LifecycleStage::Runtime;
    if runtime && !merge_processes(old, &mut alert) {
        return None;
    }

    alert.id = old.id.clone();
    alert.first_occurred = old.first_occurred;
    if alert.enforcement.is_none() {
        alert.enforcement = old.enforcement.clone();
    }
    if alert.lifecycle_stage == LifecycleStage::Deploy
        && old.lifecycle_stage == LifecycleStage::Deploy
        && alert.violations == old.violations
    {
        alert.time = old.time;
    }

    (alert != *old).then_some(alert)
}

/// Keep the previous alert's processes and append only newer ones, capped at
/// [`MAX_PROCESSES_PER_ALERT`]. Returns whether anything new was added.
fn merge_processes(old: &Alert, alert: &mut Alert) -> bool {
    if alert.processes.is_empty() || old.processes.len() >= MAX_PROCESSES_PER_ALERT {
        return false;
    }
    let Some(last) = old.processes.last().map(|p| p.signal.time) else {
        // Nothing to merge with; the new processes stand on their own.
        alert.processes.truncate(MAX_PROCESSES_PER_ALERT);
        return true;
    };

    let newer: Vec<_> = alert
        .processes
        .iter()
        .filter(|p| p.signal.time > last)
        .cloned()
        .collect();
    if newer.is_empty() {
        return false;
    }
    let mut merged = old.processes.clone();
    merged.extend(newer);
    merged.truncate(MAX_PROCESSES_PER_ALERT);
    alert.processes = merged;
    true
}

// ── Manager ─────────────────────────────────────────────────────────

/// Persists reconciled alerts and notifies about new ones.
pub struct AlertManager {
    alerts: Arc<dyn AlertStore>,
    notifier: Arc<dyn Notifier>,
}

impl AlertManager {
    pub fn new(alerts: Arc<dyn AlertStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { alerts, notifier }
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.alerts
    }

    /// Reconcile `current` against `previous`, persist the diff, and notify
    /// about new alerts whose save succeeded.
    ///
    /// Individual failures do not stop the batch; they are returned together
    /// once everything has been attempted.
    pub async fn alert_and_notify(
        &self,
        previous: Vec<Alert>,
        current: Vec<Alert>,
    ) -> Result<AlertDiff> {
        let diff = merge_alerts(&previous, current, Utc::now());
        let mut errors = ErrorList::new("reconciling alerts");

        for alert in &diff.new {
            if let Err(e) = self.alerts.add_alert(alert).await {
                warn!(alert_id = %alert.id, policy_id = %alert.policy_id(), error = %e, "failed to save new alert");
                errors.add_message(format!("adding alert {}: {e}", alert.id));
                continue;
            }
            if let Err(e) = self.notifier.process_alert(alert).await {
                warn!(alert_id = %alert.id, error = %e, "failed to notify about alert");
                errors.add_message(format!("notifying alert {}: {e}", alert.id));
            }
        }
        for alert in diff.updated.iter().chain(&diff.stale) {
            if let Err(e) = self.alerts.update_alert(alert).await {
                warn!(alert_id = %alert.id, stale = alert.stale, error = %e, "failed to update alert");
                errors.add_message(format!("updating alert {}: {e}", alert.id));
            }
        }

        if diff.is_empty() {
            debug!("no alert changes");
        } else {
            info!(
                new = diff.new.len(),
                updated = diff.updated.len(),
                stale = diff.stale.len(),
                "alerts reconciled"
            );
        }
        errors.into_result()?;
        Ok(diff)
    }

    /// Load the previous alerts matching `query`, then reconcile.
    pub async fn reconcile(&self, query: &AlertQuery, current: Vec<Alert>) -> Result<AlertDiff> {
        let previous = self.alerts.search_raw_alerts(query).await?;
        self.alert_and_notify(previous, current).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;
    use stackwatch_core::{
        AlertDeployment, AlertEntity, Policy, ProcessIndicator, ProcessSignal, StackwatchError,
        Violation,
    };

    use super::*;
    use crate::memory::{MemoryAlertStore, RecordingNotifier};

    fn policy(id: &str, stage: &str) -> Policy {
        serde_yaml::from_str(&format!("id: {id}\nname: {id}\nlifecycleStages: [{stage}]\n")).unwrap()
    }

    fn entity(id: &str) -> AlertEntity {
        AlertEntity::Deployment(AlertDeployment {
            id: id.to_string(),
            name: format!("{id}-app"),
            namespace: "prod".to_string(),
            cluster_id: "c1".to_string(),
            cluster_name: "main".to_string(),
            deployment_type: "Deployment".to_string(),
            inactive: false,
        })
    }

    fn deploy_alert(policy_id: &str, entity_id: &str, message: &str) -> Alert {
        Alert::new(
            LifecycleStage::Deploy,
            &policy(policy_id, "DEPLOY"),
            entity(entity_id),
            vec![Violation::new("imageName", message)],
        )
    }

    fn process(id: &str, time: DateTime<Utc>) -> ProcessIndicator {
        ProcessIndicator {
            id: id.to_string(),
            deployment_id: "d1".to_string(),
            container_name: "main".to_string(),
            signal: ProcessSignal {
                name: "bash".to_string(),
                args: String::new(),
                exec_file_path: "/bin/bash".to_string(),
                uid: 0,
                time,
                lineage: Vec::new(),
            },
        }
    }

    fn runtime_alert(processes: Vec<ProcessIndicator>) -> Alert {
        let mut alert = Alert::new(
            LifecycleStage::Runtime,
            &policy("shell", "RUNTIME"),
            entity("d1"),
            vec![Violation::new("processPolicy", "bash executed")],
        );
        alert.processes = processes;
        alert
    }

    #[test]
    fn redetection_keeps_identity() {
        let t0 = Utc::now() - Duration::hours(2);
        let first = t0 - Duration::days(1);
        let mut old = deploy_alert("p1", "d1", "uses latest");
        old.id = "a1".to_string();
        old.time = t0;
        old.first_occurred = Some(first);

        let now = Utc::now();
        let same = deploy_alert("p1", "d1", "uses latest");
        let diff = merge_alerts(&[old.clone()], vec![same], now);
        assert!(diff.is_empty(), "unchanged alert is not rewritten: {diff:?}");

        let changed = deploy_alert("p1", "d1", "uses latest and runs privileged");
        let diff = merge_alerts(&[old], vec![changed], now);
        assert_eq!(diff.updated.len(), 1);
        let updated = &diff.updated[0];
        assert_eq!(updated.id, "a1");
        assert_eq!(updated.first_occurred, Some(first));
        assert!(updated.time > t0);
        assert!(diff.new.is_empty() && diff.stale.is_empty());
    }

    #[test]
    fn missing_alerts_go_stale() {
        let previous = vec![deploy_alert("p1", "d1", "x"), deploy_alert("p2", "d2", "y")];
        let now = Utc::now();
        let diff = merge_alerts(
            &previous,
            vec![deploy_alert("p1", "d1", "x"), deploy_alert("p3", "d3", "z")],
            now,
        );

        assert_eq!(diff.stale.len(), 1);
        assert_eq!(diff.stale[0].policy_id(), "p2");
        assert!(diff.stale[0].stale);
        assert_eq!(diff.stale[0].marked_stale, Some(now));

        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.new[0].policy_id(), "p3");
        assert_eq!(diff.new[0].first_occurred, Some(now));
    }

    #[test]
    fn previous_enforcement_survives_update() {
        let mut old = deploy_alert("p1", "d1", "x");
        old.enforcement = crate::enforcement::enforcement_for(
            stackwatch_core::EnforcementAction::ScaleToZero,
            "d1-app",
        );
        let diff = merge_alerts(&[old.clone()], vec![deploy_alert("p1", "d1", "y")], Utc::now());
        assert_eq!(diff.updated[0].enforcement, old.enforcement);
    }

    #[test]
    fn runtime_alerts_accumulate_newer_processes() {
        let base = Utc::now() - Duration::minutes(10);
        let old = runtime_alert(vec![process("p0", base)]);

        let replay = runtime_alert(vec![process("p0", base)]);
        assert!(merge_alerts(&[old.clone()], vec![replay], Utc::now()).is_empty());

        let newer = runtime_alert(vec![
            process("early", base - Duration::minutes(1)),
            process("p1", base + Duration::minutes(1)),
        ]);
        let diff = merge_alerts(&[old.clone()], vec![newer], Utc::now());
        let ids: Vec<&str> = diff.updated[0].processes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p1"]);
        assert_eq!(diff.updated[0].id, old.id);
    }

    #[test]
    fn runtime_alert_process_cap() {
        let base = Utc::now() - Duration::hours(1);
        let full: Vec<_> = (0..MAX_PROCESSES_PER_ALERT as i64)
            .map(|i| process(&format!("p{i}"), base + Duration::seconds(i)))
            .collect();
        let old = runtime_alert(full);
        let more = runtime_alert(vec![process("late", Utc::now())]);
        assert!(merge_alerts(&[old], vec![more], Utc::now()).is_empty());

        let almost: Vec<_> = (0..MAX_PROCESSES_PER_ALERT as i64 - 1)
            .map(|i| process(&format!("p{i}"), base + Duration::seconds(i)))
            .collect();
        let old = runtime_alert(almost);
        let more = runtime_alert(vec![
            process("a", Utc::now()),
            process("b", Utc::now() + Duration::seconds(1)),
        ]);
        let diff = merge_alerts(&[old], vec![more], Utc::now());
        assert_eq!(diff.updated[0].processes.len(), MAX_PROCESSES_PER_ALERT);
        assert_eq!(diff.updated[0].processes.last().unwrap().id, "a");
    }

    #[tokio::test]
    async fn new_alert_notified_once() {
        let store = Arc::new(MemoryAlertStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = AlertManager::new(store.clone(), notifier.clone());
        let query = AlertQuery::for_policy("p1").with_stage(LifecycleStage::Deploy);

        let diff = manager
            .reconcile(&query, vec![deploy_alert("p1", "d1", "x")])
            .await
            .unwrap();
        assert_eq!(diff.new.len(), 1);
        assert_eq!(notifier.count(), 1);
        assert_eq!(store.len(), 1);

        let diff = manager
            .reconcile(&query, vec![deploy_alert("p1", "d1", "x")])
            .await
            .unwrap();
        assert!(diff.is_empty());
        assert_eq!(notifier.count(), 1);

        let diff = manager.reconcile(&query, Vec::new()).await.unwrap();
        assert_eq!(diff.stale.len(), 1);
        assert!(store.all()[0].stale);
        assert!(store.search_raw_alerts(&query).await.unwrap().is_empty());
    }

    /// Rejects new alerts for one policy.
    struct RejectingStore {
        inner: MemoryAlertStore,
        reject: &'static str,
    }

    #[async_trait]
    impl AlertStore for RejectingStore {
        async fn search_raw_alerts(
            &self,
            query: &AlertQuery,
        ) -> stackwatch_core::Result<Vec<Alert>> {
            self.inner.search_raw_alerts(query).await
        }

        async fn add_alert(&self, alert: &Alert) -> stackwatch_core::Result<()> {
            if alert.policy_id() == self.reject {
                return Err(StackwatchError::Store("disk full".to_string()));
            }
            self.inner.add_alert(alert).await
        }

        async fn update_alert(&self, alert: &Alert) -> stackwatch_core::Result<()> {
            self.inner.update_alert(alert).await
        }
    }

    #[tokio::test]
    async fn failed_save_suppresses_notification() {
        let store = Arc::new(RejectingStore {
            inner: MemoryAlertStore::new(),
            reject: "p1",
        });
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = AlertManager::new(store.clone(), notifier.clone());

        let err = manager
            .alert_and_notify(
                Vec::new(),
                vec![deploy_alert("p1", "d1", "x"), deploy_alert("p2", "d1", "y")],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");

        let notified: Vec<String> = notifier.alerts().iter().map(|a| a.policy_id().to_string()).collect();
        assert_eq!(notified, vec!["p2"]);
        assert_eq!(store.inner.len(), 1);
    }
}
