//! Filesystem event handler for the notify watcher (hot-reload).

use std::fs;
use std::path::Path;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use stackwatch_core::Policy;

use super::core::{is_dotfile, is_yaml, parse_policy, LoadedPolicies};

/// A policy file change seen by the watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Upserted(Policy),
    Removed(String),
}

/// Handle a single filesystem event. Runs on the watcher's own thread.
pub(super) fn handle_fs_event(
    event: &Event,
    loaded: &LoadedPolicies,
    events: &mpsc::Sender<PolicyEvent>,
) {
    for path in &event.paths {
        // Our own temp files are dot-prefixed.
        if !is_yaml(path) || is_dotfile(path) {
            continue;
        }

        match &event.kind {
            EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(_)) => {
                if !path.exists() {
                    // Renamed away.
                    removed(path, loaded, events);
                    continue;
                }
                reload(path, loaded, events);
            }
            EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
                removed(path, loaded, events);
            }
            _ => {}
        }
    }
}

fn reload(path: &Path, loaded: &LoadedPolicies, events: &mpsc::Sender<PolicyEvent>) {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read file during hot-reload");
            return;
        }
    };
    match parse_policy(&contents) {
        Ok(policy) => {
            info!(policy_id = %policy.id, path = %path.display(), "hot-reloaded policy");
            if let Some(old) = loaded.insert(path.to_path_buf(), policy.clone()) {
                send(events, PolicyEvent::Removed(old));
            }
            send(events, PolicyEvent::Upserted(policy));
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "failed to parse policy during hot-reload, keeping previous version"
            );
        }
    }
}

fn removed(path: &Path, loaded: &LoadedPolicies, events: &mpsc::Sender<PolicyEvent>) {
    if let Some(event) = loaded.remove_path(path) {
        if let PolicyEvent::Removed(id) = &event {
            info!(policy_id = %id, path = %path.display(), "removed policy after file deletion");
        }
        send(events, event);
    }
}

fn send(events: &mpsc::Sender<PolicyEvent>, event: PolicyEvent) {
    if events.blocking_send(event).is_err() {
        debug!("policy event receiver dropped");
    }
}
