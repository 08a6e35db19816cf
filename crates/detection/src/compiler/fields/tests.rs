use chrono::{Duration, Utc};
use serde_json::json;

use stackwatch_core::{Deployment, Image, ImageName, PolicyFields, ProcessIndicator};

use super::*;
use crate::combinators::MatchCache;
use crate::entity::EntityRef;

fn fields(yaml: &str) -> PolicyFields {
    serde_yaml::from_str(yaml).unwrap()
}

fn compile_one(yaml: &str) -> Matcher {
    let fields = fields(yaml);
    let mut matchers = FIELD_COMPILERS
        .iter()
        .filter_map(|(_, compile)| compile(&fields).unwrap());
    let matcher = matchers.next().expect("one criterion");
    assert!(matchers.next().is_none(), "expected a single criterion");
    matcher
}

fn deployment(value: serde_json::Value) -> Deployment {
    serde_json::from_value(value).unwrap()
}

fn web() -> Deployment {
    deployment(json!({
        "id": "d1",
        "name": "web",
        "namespace": "prod",
        "labels": { "app": "web" },
        "serviceAccount": "web-sa",
        "serviceAccountPermissionLevel": "ELEVATED_IN_NAMESPACE",
        "containers": [{
            "name": "nginx",
            "image": { "id": "sha256:1", "name": ImageName::parse("nginx") },
            "config": {
                "env": [{ "key": "AWS_SECRET_ACCESS_KEY", "value": "x" }],
                "command": ["nginx", "-g", "daemon off;"]
            },
            "securityContext": {
                "privileged": true,
                "addCapabilities": ["NET_ADMIN"],
                "dropCapabilities": ["ALL"]
            },
            "ports": [{ "containerPort": 22 }],
            "volumes": [{ "name": "docker-sock", "source": "/var/run/docker.sock", "destination": "/var/run/docker.sock", "type": "HostPath" }],
            "resources": { "cpuCoresRequest": 0.0, "memoryMbLimit": 0.0 }
        }]
    }))
}

fn scanned_image() -> Image {
    serde_json::from_value(json!({
        "id": "sha256:1",
        "name": ImageName::parse("nginx"),
        "metadata": { "created": Utc::now() - Duration::days(400) },
        "scan": {
            "scanTime": Utc::now() - Duration::days(60),
            "components": [{
                "name": "openssl",
                "version": "1.1.1k",
                "vulns": [{ "cve": "CVE-2022-0778", "cvss": 7.5 }]
            }]
        }
    }))
    .unwrap()
}

fn run_deployment(matcher: &Matcher, deployment: &Deployment, images: &[Image]) -> Vec<String> {
    let entity = EntityRef::Deployment { deployment, images };
    matcher
        .run(&entity, &mut MatchCache::new())
        .unwrap()
        .into_iter()
        .map(|v| v.message)
        .collect()
}

#[test]
fn no_criteria_no_matchers() {
    let fields = PolicyFields::default();
    for (name, compile) in FIELD_COMPILERS {
        assert!(compile(&fields).unwrap().is_none(), "{name} compiled from nothing");
    }
}

#[test]
fn image_name_matches_per_container() {
    let matcher = compile_one("imageName:\n  tag: '^latest$'\n");
    let d = web();
    let messages = run_deployment(&matcher, &d, &[]);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Container 'nginx'"));

    let img = Image::from_name("sha256:2", ImageName::parse("nginx:1.25"));
    let out = matcher
        .run(&EntityRef::Image(&img), &mut MatchCache::new())
        .unwrap();
    assert!(out.is_empty());
}

#[test]
fn invalid_regex_fails_compilation() {
    let fields = fields("imageName:\n  tag: '^^[/'\n");
    let err = match image::image_name(&fields) {
        Err(e) => e,
        Ok(_) => panic!("expected compile error"),
    };
    assert!(matches!(err, CompileError::InvalidRegex { field: "imageName.tag", .. }));
}

#[test]
fn empty_criteria_are_rejected() {
    assert!(image::image_name(&fields("imageName: {}\n")).is_err());
    assert!(container::port(&fields("portPolicy: {}\n")).is_err());
    assert!(process::process(&fields("processPolicy: {}\n")).is_err());
    assert!(deployment::required_label(&fields("requiredLabel:\n  value: x\n")).is_err());
}

#[test]
fn image_scan_criteria() {
    let d = web();
    let images = vec![scanned_image()];

    let cvss = compile_one("cvss:\n  op: gte\n  value: 7\n");
    assert_eq!(run_deployment(&cvss, &d, &images).len(), 1);
    let cvss_high = compile_one("cvss:\n  op: gt\n  value: 9\n");
    assert!(run_deployment(&cvss_high, &d, &images).is_empty());

    let cve = compile_one("cve: 'CVE-2022-.*'\n");
    assert_eq!(run_deployment(&cve, &d, &images).len(), 1);

    let component = compile_one("component:\n  name: openssl\n  version: '^1\\.1'\n");
    assert_eq!(run_deployment(&component, &d, &images).len(), 1);

    let age = compile_one("imageAgeDays: 365\n");
    assert_eq!(run_deployment(&age, &d, &images).len(), 1);

    let scan_age = compile_one("scanAgeDays: 90\n");
    assert!(run_deployment(&scan_age, &d, &images).is_empty());

    // The container image is not in the list, so it counts as unscanned.
    let unscanned = compile_one("unscannedImage: true\n");
    assert_eq!(run_deployment(&unscanned, &d, &[]).len(), 1);
    assert!(run_deployment(&unscanned, &d, &images).is_empty());
}

#[test]
fn out_of_range_ages_are_rejected() {
    for yaml in [
        "imageAgeDays: 100000000\n",
        "imageAgeDays: 9223372036854775807\n",
        "imageAgeDays: -1\n",
    ] {
        let err = match image::image_age(&fields(yaml)) {
            Err(e) => e,
            Ok(_) => panic!("{yaml} should not compile"),
        };
        assert!(matches!(err, CompileError::InvalidField { field: "imageAgeDays", .. }), "{err}");
    }
    for yaml in ["scanAgeDays: 100000000\n", "scanAgeDays: 9223372036854775807\n"] {
        let err = match image::scan_age(&fields(yaml)) {
            Err(e) => e,
            Ok(_) => panic!("{yaml} should not compile"),
        };
        assert!(matches!(err, CompileError::InvalidField { field: "scanAgeDays", .. }), "{err}");
    }

    // The largest accepted span still evaluates against a fresh image.
    let old = compile_one("imageAgeDays: 36500\n");
    let fresh: Image = serde_json::from_value(json!({
        "id": "sha256:1",
        "name": ImageName::parse("nginx"),
        "metadata": { "created": Utc::now() }
    }))
    .unwrap();
    assert!(run_deployment(&old, &web(), &[fresh]).is_empty());
}

#[test]
fn container_criteria() {
    let d = web();
    let cases = [
        ("env:\n  key: '^AWS_'\n", 1),
        ("command: 'nginx'\n", 1),
        ("args: '.*'\n", 0),
        ("volumePolicy:\n  source: 'docker\\.sock'\n", 1),
        ("portPolicy:\n  port: 22\n", 1),
        ("portPolicy:\n  port: 22\n  protocol: udp\n", 0),
        ("privileged: true\n", 1),
        ("privileged: false\n", 0),
        ("readOnlyRootFs: false\n", 1),
        ("addCapabilities: [net_admin]\n", 1),
        ("dropCapabilities: [ALL]\n", 0),
        ("dropCapabilities: [ALL, NET_RAW]\n", 1),
        ("containerResources:\n  cpuRequest: { op: eq, value: 0 }\n  memoryLimit: { op: eq, value: 0 }\n", 1),
        ("containerResources:\n  cpuRequest: { op: gt, value: 0 }\n", 0),
    ];
    for (yaml, expected) in cases {
        let matcher = compile_one(yaml);
        assert_eq!(run_deployment(&matcher, &d, &[]).len(), expected, "{yaml}");
    }
}

#[test]
fn deployment_criteria() {
    let d = web();
    let owner = compile_one("requiredLabel:\n  key: owner\n");
    let messages = run_deployment(&owner, &d, &[]);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Required label not found"));

    let app = compile_one("requiredLabel:\n  key: app\n  value: '^web$'\n");
    assert!(run_deployment(&app, &d, &[]).is_empty());

    let annotation = compile_one("requiredAnnotation:\n  key: email\n");
    assert_eq!(run_deployment(&annotation, &d, &[]).len(), 1);

    let rbac = compile_one("permissionPolicy:\n  permissionLevel: ELEVATED_IN_NAMESPACE\n");
    assert_eq!(run_deployment(&rbac, &d, &[]).len(), 1);
    let admin = compile_one("permissionPolicy:\n  permissionLevel: CLUSTER_ADMIN\n");
    assert!(run_deployment(&admin, &d, &[]).is_empty());
}

#[test]
fn process_criteria_only_see_process_events() {
    let d = web();
    let matcher = compile_one("processPolicy:\n  name: '^(bash|sh)$'\n  ancestor: 'nginx'\n");
    assert!(run_deployment(&matcher, &d, &[]).is_empty());

    let indicator: ProcessIndicator = serde_json::from_value(json!({
        "id": "p1",
        "deploymentId": "d1",
        "containerName": "nginx",
        "signal": {
            "name": "bash",
            "args": "-i",
            "execFilePath": "/bin/bash",
            "time": Utc::now(),
            "lineage": ["/usr/sbin/nginx"]
        }
    }))
    .unwrap();
    let entity = EntityRef::Process {
        deployment: &d,
        images: &[],
        indicator: &indicator,
    };
    let violations = matcher.run(&entity, &mut MatchCache::new()).unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].evidence, vec!["bash"]);
}
