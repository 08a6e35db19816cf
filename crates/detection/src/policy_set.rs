//! The registry of compiled policies.
//!
//! A single read/write lock guards the map. Compilation happens before the
//! write lock is taken, so readers never wait on the compiler and never see a
//! half-installed policy.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use stackwatch_core::Policy;

use crate::compiler::{compile, CompiledPolicy};
use crate::detector::Executor;
use crate::error::{DetectionError, ErrorList, Result};
use crate::store::PolicyStore;

pub struct PolicySet {
    policies: RwLock<BTreeMap<String, Arc<CompiledPolicy>>>,
    store: Arc<dyn PolicyStore>,
}

impl PolicySet {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            policies: RwLock::new(BTreeMap::new()),
            store,
        }
    }

    /// Install every policy the store holds.
    ///
    /// Policies that fail to compile are logged and skipped; the number of
    /// installed policies is returned.
    pub async fn load_from_store(&self) -> Result<usize> {
        let policies = self.store.get_policies().await?;
        let mut installed = 0;
        for policy in &policies {
            match self.upsert_policy(policy) {
                Ok(()) => installed += 1,
                Err(e) => warn!(policy_id = %policy.id, error = %e, "skipping policy that does not compile"),
            }
        }
        info!(installed, total = policies.len(), "policies loaded from store");
        Ok(installed)
    }

    /// Compile and install `policy`, replacing any previous version.
    ///
    /// On failure the previous version, if any, stays installed.
    pub fn upsert_policy(&self, policy: &Policy) -> Result<()> {
        self.install(compile(policy)?);
        Ok(())
    }

    /// Install an already compiled policy, replacing any previous version.
    pub fn install(&self, compiled: CompiledPolicy) {
        let policy_id = compiled.id().to_string();
        let name = compiled.policy().name.clone();
        let replaced = self
            .policies
            .write()
            .expect("policy set lock poisoned")
            .insert(policy_id.clone(), Arc::new(compiled))
            .is_some();
        info!(policy_id = %policy_id, name = %name, replaced, "policy installed");
    }

    /// Remove a policy. Removing an unknown id is not an error.
    pub fn remove_policy(&self, id: &str) -> Result<()> {
        let removed = self
            .policies
            .write()
            .expect("policy set lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            info!(policy_id = %id, "policy removed");
        } else {
            debug!(policy_id = %id, "remove requested for unknown policy");
        }
        Ok(())
    }

    /// Run `executor` against one policy.
    pub fn for_one(&self, id: &str, executor: &mut dyn Executor) -> Result<()> {
        let policies = self.policies.read().expect("policy set lock poisoned");
        let compiled = policies
            .get(id)
            .ok_or_else(|| DetectionError::PolicyNotFound(id.to_string()))?;
        executor.execute(compiled)
    }

    /// Run `executor` against every policy in id order, stopping at the
    /// first error.
    pub fn for_each(&self, executor: &mut dyn Executor) -> Result<()> {
        let policies = self.policies.read().expect("policy set lock poisoned");
        for compiled in policies.values() {
            executor.execute(compiled)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompiledPolicy>> {
        self.policies
            .read()
            .expect("policy set lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.policies
            .read()
            .expect("policy set lock poisoned")
            .contains_key(id)
    }

    /// Snapshot of the installed policies in id order.
    pub fn snapshot(&self) -> Vec<Arc<CompiledPolicy>> {
        self.policies
            .read()
            .expect("policy set lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.policies.read().expect("policy set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Strip `notifier_id` from every policy referencing it.
    ///
    /// Each affected policy is cloned, the clone persisted, and only then
    /// swapped into the registry. Failures for one policy do not stop the
    /// others; they are returned together.
    pub async fn remove_notifier(&self, notifier_id: &str) -> Result<()> {
        let affected: Vec<Arc<CompiledPolicy>> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.policy().notifiers.iter().any(|n| n == notifier_id))
            .collect();

        let mut errors = ErrorList::new(format!("removing notifier {notifier_id}"));
        for current in affected {
            let original = current.policy();
            let mut updated = original.clone();
            updated.notifiers.retain(|n| n != notifier_id);

            if let Err(e) = self.store.update_policy(&updated).await {
                warn!(policy_id = %updated.id, error = %e, "failed to persist policy without notifier");
                errors.add_message(format!("policy {}: {e}", updated.id));
                continue;
            }
            let Some(compiled) = errors.add(compile(&updated)) else {
                continue;
            };

            self.swap_if_unchanged(original, compiled);
        }
        errors.into_result()
    }

    /// Install `compiled` unless the entry changed since `original` was read.
    fn swap_if_unchanged(&self, original: &Policy, compiled: CompiledPolicy) {
        let mut policies = self.policies.write().expect("policy set lock poisoned");
        match policies.get(&original.id) {
            Some(installed) if installed.policy() == original => {
                debug!(policy_id = %original.id, "policy updated in place");
                policies.insert(original.id.clone(), Arc::new(compiled));
            }
            _ => debug!(policy_id = %original.id, "policy changed concurrently, keeping newer version"),
        }
    }
}
