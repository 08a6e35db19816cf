//! Core [`PolicyLoader`] struct: filesystem-backed policy loading with optional hot-reload.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use stackwatch_core::Policy;

use super::error::{LoadResult, LoadStatus, LoaderError, Result};
use super::watcher::{handle_fs_event, PolicyEvent};
use crate::store::PolicyStore;

/// Parsed policies plus the file each one came from.
#[derive(Debug, Default)]
pub(super) struct LoadedPolicies {
    documents: RwLock<BTreeMap<String, Policy>>,
    paths: RwLock<HashMap<PathBuf, String>>,
}

impl LoadedPolicies {
    /// Record `policy` as the content of `path`. Returns the id the file held
    /// before, if it named a different policy.
    pub(super) fn insert(&self, path: PathBuf, policy: Policy) -> Option<String> {
        let id = policy.id.clone();
        let previous = self
            .paths
            .write()
            .expect("paths lock poisoned")
            .insert(path, id.clone())
            .filter(|old| *old != id);
        let mut documents = self.documents.write().expect("documents lock poisoned");
        if let Some(old) = &previous {
            documents.remove(old);
        }
        documents.insert(id, policy);
        previous
    }

    /// Forget the file at `path` and return the change to publish, if any.
    ///
    /// When another file still defines the same policy id, that file's
    /// content becomes the loaded version and is published as an upsert.
    pub(super) fn remove_path(&self, path: &Path) -> Option<PolicyEvent> {
        let mut paths = self.paths.write().expect("paths lock poisoned");
        let id = paths.remove(path)?;
        let others: Vec<PathBuf> = paths
            .iter()
            .filter(|(_, policy_id)| **policy_id == id)
            .map(|(p, _)| p.clone())
            .collect();
        drop(paths);

        for other in others {
            match fs::read_to_string(&other)
                .map_err(LoaderError::from)
                .and_then(|contents| parse_policy(&contents))
            {
                Ok(policy) if policy.id == id => {
                    info!(policy_id = %id, path = %other.display(), "policy still defined by another file");
                    self.documents
                        .write()
                        .expect("documents lock poisoned")
                        .insert(id, policy.clone());
                    return Some(PolicyEvent::Upserted(policy));
                }
                _ => {
                    warn!(policy_id = %id, path = %other.display(), "stale policy file mapping dropped");
                    self.paths.write().expect("paths lock poisoned").remove(&other);
                }
            }
        }

        self.documents
            .write()
            .expect("documents lock poisoned")
            .remove(&id);
        Some(PolicyEvent::Removed(id))
    }

    fn path_of(&self, id: &str) -> Option<PathBuf> {
        self.paths
            .read()
            .expect("paths lock poisoned")
            .iter()
            .find(|(_, policy_id)| policy_id.as_str() == id)
            .map(|(path, _)| path.clone())
    }
}

/// Filesystem-backed policy loader with optional hot-reload.
///
/// Scans a directory (recursively) for `*.yml` / `*.yaml` policy documents and
/// keeps them in memory keyed by policy id.
pub struct PolicyLoader {
    policy_dir: PathBuf,
    loaded: Arc<LoadedPolicies>,
    /// Active filesystem watcher (held to keep it alive).
    _watcher: Option<RecommendedWatcher>,
}

impl PolicyLoader {
    /// Create a loader for `policy_dir`, creating the directory if needed.
    pub fn new(policy_dir: PathBuf) -> Self {
        if !policy_dir.exists() {
            if let Err(e) = fs::create_dir_all(&policy_dir) {
                warn!(path = %policy_dir.display(), error = %e, "failed to create policy directory");
            }
        }
        // Watcher events carry canonical paths.
        let policy_dir = fs::canonicalize(&policy_dir).unwrap_or(policy_dir);
        Self {
            policy_dir,
            loaded: Arc::new(LoadedPolicies::default()),
            _watcher: None,
        }
    }

    /// Recursively scan the policy directory and load every YAML file.
    ///
    /// Parse errors are reported per file and do not abort the scan.
    pub fn load_all(&self) -> Result<Vec<LoadResult>> {
        let mut results = Vec::new();
        self.scan_dir(&self.policy_dir, &mut results)?;
        Ok(results)
    }

    fn scan_dir(&self, dir: &Path, results: &mut Vec<LoadResult>) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();

        for path in entries {
            if is_dotfile(&path) {
                if path.is_file() {
                    results.push(LoadResult {
                        path,
                        status: LoadStatus::Skipped {
                            reason: "dotfile".to_string(),
                        },
                    });
                }
                continue;
            }
            if path.is_dir() {
                self.scan_dir(&path, results)?;
                continue;
            }
            if !is_yaml(&path) {
                results.push(LoadResult {
                    path,
                    status: LoadStatus::Skipped {
                        reason: "not a YAML file".to_string(),
                    },
                });
                continue;
            }

            match self.load_file(&path) {
                Ok(policy) => {
                    let policy_id = policy.id.clone();
                    if self.loaded.path_of(&policy_id).is_some_and(|p| p != path) {
                        warn!(policy_id = %policy_id, path = %path.display(), "policy id defined in several files, last one wins");
                    }
                    info!(policy_id = %policy_id, path = %path.display(), "loaded policy");
                    self.loaded.insert(path.clone(), policy);
                    results.push(LoadResult {
                        path,
                        status: LoadStatus::Loaded { policy_id },
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load policy file");
                    results.push(LoadResult {
                        path,
                        status: LoadStatus::Failed {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// Parse a single policy document.
    pub fn load_file(&self, path: &Path) -> Result<Policy> {
        parse_policy(&fs::read_to_string(path)?)
    }

    /// Start watching the directory. Changed files are re-parsed and sent to
    /// `events`; a file that no longer parses keeps its previous version.
    pub fn watch(&mut self, events: mpsc::Sender<PolicyEvent>) -> Result<()> {
        let loaded = Arc::clone(&self.loaded);
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => handle_fs_event(&event, &loaded, &events),
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
        )?;
        watcher.watch(&self.policy_dir, RecursiveMode::Recursive)?;
        let _ = watcher
            .configure(notify::Config::default().with_poll_interval(Duration::from_millis(500)));

        info!(path = %self.policy_dir.display(), "watching policy directory for changes");
        self._watcher = Some(watcher);
        Ok(())
    }

    pub fn policy_dir(&self) -> &Path {
        &self.policy_dir
    }

    /// Currently loaded policies, ordered by id.
    pub fn policies(&self) -> Vec<Policy> {
        self.loaded
            .documents
            .read()
            .expect("documents lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.loaded
            .documents
            .read()
            .expect("documents lock poisoned")
            .get(id)
            .cloned()
    }

    /// Atomically write `policy` back to its file (or `<id>.yml` for a new one).
    ///
    /// Writes a dot-prefixed temp file first and renames it into place.
    pub fn write_policy(&self, policy: &Policy) -> Result<PathBuf> {
        if policy.id.is_empty() {
            return Err(LoaderError::Validation("policy id must not be empty".to_string()));
        }
        let final_path = self
            .loaded
            .path_of(&policy.id)
            .unwrap_or_else(|| self.policy_dir.join(format!("{}.yml", policy.id)));
        let dir = final_path.parent().unwrap_or(self.policy_dir.as_path());
        let tmp_path = dir.join(format!(".{}.tmp", policy.id));

        fs::write(&tmp_path, serde_yaml::to_string(policy)?)?;
        fs::rename(&tmp_path, &final_path)?;
        info!(policy_id = %policy.id, path = %final_path.display(), "wrote policy file");

        self.loaded.insert(final_path.clone(), policy.clone());
        Ok(final_path)
    }
}

#[async_trait]
impl PolicyStore for PolicyLoader {
    async fn get_policies(&self) -> stackwatch_core::Result<Vec<Policy>> {
        Ok(self.policies())
    }

    async fn update_policy(&self, policy: &Policy) -> stackwatch_core::Result<()> {
        self.write_policy(policy)?;
        Ok(())
    }
}

/// Parse and sanity-check one policy document.
pub(super) fn parse_policy(contents: &str) -> Result<Policy> {
    let policy: Policy = serde_yaml::from_str(contents)?;
    if policy.id.trim().is_empty() {
        return Err(LoaderError::Validation("policy id must not be empty".to_string()));
    }
    if policy.name.trim().is_empty() {
        return Err(LoaderError::Validation(format!(
            "policy '{}' has no name",
            policy.id
        )));
    }
    Ok(policy)
}

pub(super) fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "yml" || e == "yaml")
        .unwrap_or(false)
}

pub(super) fn is_dotfile(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
