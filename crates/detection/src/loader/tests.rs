//! Tests for the policy loader module.

use std::fs;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::core::LoadedPolicies;
use super::watcher::handle_fs_event;
use super::*;
use crate::store::PolicyStore;

const LATEST_YAML: &str = r#"
id: latest
name: Latest tag
categories: [DevOps Best Practices]
lifecycleStages: [BUILD, DEPLOY]
fields:
  imageName:
    tag: "^latest$"
notifiers: [slack]
"#;

const PRIVILEGED_YAML: &str = r#"
id: privileged
name: Privileged container
lifecycleStages: [DEPLOY]
fields:
  privileged: true
"#;

fn temp_loader() -> (TempDir, PolicyLoader) {
    let dir = TempDir::new().expect("create tempdir");
    let loader = PolicyLoader::new(dir.path().to_path_buf());
    (dir, loader)
}

#[test]
fn load_policy_from_file() {
    let (_dir, loader) = temp_loader();
    let path = loader.policy_dir().join("latest.yml");
    fs::write(&path, LATEST_YAML).unwrap();

    let policy = loader.load_file(&path).unwrap();
    assert_eq!(policy.id, "latest");
    assert_eq!(policy.name, "Latest tag");
    assert_eq!(policy.notifiers, vec!["slack"]);
}

#[test]
fn load_all_skips_dotfiles_and_non_yaml() {
    let (_dir, loader) = temp_loader();
    let root = loader.policy_dir().to_path_buf();
    fs::write(root.join("latest.yml"), LATEST_YAML).unwrap();
    fs::write(root.join(".hidden.yml"), LATEST_YAML).unwrap();
    fs::write(root.join("readme.txt"), "not a policy").unwrap();

    let results = loader.load_all().unwrap();
    assert_eq!(results.iter().filter(|r| r.is_loaded()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r.status, LoadStatus::Skipped { .. }))
            .count(),
        2
    );
    assert!(loader.get("latest").is_some());
}

#[test]
fn load_all_recurses_and_reports_failures() {
    let (_dir, loader) = temp_loader();
    let root = loader.policy_dir().to_path_buf();
    fs::create_dir_all(root.join("runtime/nested")).unwrap();
    fs::write(root.join("runtime/nested/privileged.yaml"), PRIVILEGED_YAML).unwrap();
    fs::write(root.join("broken.yml"), "id: [unclosed").unwrap();
    fs::write(root.join("nameless.yml"), "id: nameless\nname: ''\n").unwrap();
    fs::write(root.join("unknown.yml"), "id: x\nname: x\nbogus: 1\n").unwrap();

    let results = loader.load_all().unwrap();
    assert_eq!(results.iter().filter(|r| r.is_failed()).count(), 3);
    let ids: Vec<String> = loader.policies().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["privileged"]);
}

#[test]
fn new_creates_missing_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("a/b/policies");
    let loader = PolicyLoader::new(nested.clone());
    assert!(nested.is_dir());
    assert!(loader.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn store_writes_back_to_the_source_file() {
    let (_dir, loader) = temp_loader();
    let path = loader.policy_dir().join("custom-name.yml");
    fs::write(&path, LATEST_YAML).unwrap();
    loader.load_all().unwrap();

    let mut policy = loader.get_policies().await.unwrap().remove(0);
    policy.notifiers.clear();
    loader.update_policy(&policy).await.unwrap();

    let reread = loader.load_file(&path).unwrap();
    assert!(reread.notifiers.is_empty());
    assert_eq!(reread, policy);
    assert!(!loader.policy_dir().join("latest.yml").exists());

    let fresh: stackwatch_core::Policy = serde_yaml::from_str(PRIVILEGED_YAML).unwrap();
    let written = loader.write_policy(&fresh).unwrap();
    assert_eq!(written, loader.policy_dir().join("privileged.yml"));
    assert_eq!(loader.policies().len(), 2);
}

#[test]
fn watcher_events_upsert_and_remove() {
    let (_dir, loader) = temp_loader();
    let loaded = LoadedPolicies::default();
    let (tx, mut rx) = mpsc::channel(8);
    let path = loader.policy_dir().join("latest.yml");

    fs::write(&path, LATEST_YAML).unwrap();
    let created = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
    handle_fs_event(&created, &loaded, &tx);
    match rx.try_recv().unwrap() {
        PolicyEvent::Upserted(policy) => assert_eq!(policy.id, "latest"),
        other => panic!("unexpected event {other:?}"),
    }

    // A broken edit keeps the previous version and emits nothing.
    fs::write(&path, "id: [").unwrap();
    let modified = Event::new(EventKind::Modify(ModifyKind::Data(
        notify::event::DataChange::Content,
    )))
    .add_path(path.clone());
    handle_fs_event(&modified, &loaded, &tx);
    assert!(rx.try_recv().is_err());

    // Changing the id inside the file retires the old one.
    fs::write(&path, PRIVILEGED_YAML).unwrap();
    handle_fs_event(&modified, &loaded, &tx);
    assert_eq!(rx.try_recv().unwrap(), PolicyEvent::Removed("latest".to_string()));
    assert!(matches!(rx.try_recv().unwrap(), PolicyEvent::Upserted(p) if p.id == "privileged"));

    fs::remove_file(&path).unwrap();
    let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path);
    handle_fs_event(&removed, &loaded, &tx);
    assert_eq!(rx.try_recv().unwrap(), PolicyEvent::Removed("privileged".to_string()));
}

#[test]
fn deleting_a_duplicate_file_keeps_the_policy() {
    let (_dir, loader) = temp_loader();
    let loaded = LoadedPolicies::default();
    let (tx, mut rx) = mpsc::channel(8);
    let first = loader.policy_dir().join("a.yml");
    let second = loader.policy_dir().join("b.yml");

    fs::write(&first, LATEST_YAML).unwrap();
    fs::write(&second, LATEST_YAML.replace("Latest tag", "Latest tag (copy)")).unwrap();
    for path in [&first, &second] {
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        handle_fs_event(&event, &loaded, &tx);
        assert!(matches!(rx.try_recv().unwrap(), PolicyEvent::Upserted(p) if p.id == "latest"));
    }

    fs::remove_file(&second).unwrap();
    let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(second);
    handle_fs_event(&removed, &loaded, &tx);
    match rx.try_recv().unwrap() {
        PolicyEvent::Upserted(policy) => assert_eq!(policy.name, "Latest tag"),
        other => panic!("unexpected event {other:?}"),
    }

    fs::remove_file(&first).unwrap();
    let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(first);
    handle_fs_event(&removed, &loaded, &tx);
    assert_eq!(rx.try_recv().unwrap(), PolicyEvent::Removed("latest".to_string()));
    assert!(rx.try_recv().is_err());
}

#[test]
fn watcher_ignores_temp_and_foreign_files() {
    let (_dir, loader) = temp_loader();
    let loaded = LoadedPolicies::default();
    let (tx, mut rx) = mpsc::channel(8);

    let tmp = loader.policy_dir().join(".latest.tmp");
    let dot = loader.policy_dir().join(".latest.yml");
    let txt = loader.policy_dir().join("notes.txt");
    for path in [&tmp, &dot, &txt] {
        fs::write(path, LATEST_YAML).unwrap();
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        handle_fs_event(&event, &loaded, &tx);
    }
    assert!(rx.try_recv().is_err());
}
