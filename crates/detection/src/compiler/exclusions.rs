//! Applicability predicate: disabled flag, scopes and whitelists.

use chrono::Utc;

use stackwatch_core::{Deployment, DeploymentExclusion, ImageExclusion, Policy, Scope};

use crate::combinators::{and_predicates, or_predicates, Predicate};
use crate::entity::EntityRef;

/// Build the predicate deciding whether `policy` applies to an entity.
///
/// `None` means the policy applies to everything.
pub(crate) fn compile_predicate(policy: &Policy) -> Option<Predicate> {
    let enabled = policy.disabled.then(|| Predicate::new(|_| false));

    let in_scope = policy
        .scope
        .iter()
        .cloned()
        .map(scope_predicate)
        .fold(None, |acc, p| or_predicates(acc, Some(p)));

    let whitelisted = policy
        .whitelists
        .iter()
        .cloned()
        .filter_map(|w| {
            let deployment = w.deployment.map(deployment_exclusion);
            let image = w.image.map(image_exclusion);
            let expiration = w.expiration;
            // An entry naming both a deployment and an image needs both to match.
            and_predicates(deployment, image).map(|p| {
                Predicate::new(move |e| {
                    let active = expiration.map_or(true, |exp| exp > Utc::now());
                    active && p.test(e)
                })
            })
        })
        .fold(None, |acc, p| or_predicates(acc, Some(p)));

    let not_whitelisted = whitelisted.map(Predicate::negate);
    and_predicates(and_predicates(enabled, in_scope), not_whitelisted)
}

/// Scopes restrict deployments only; images are never out of scope.
fn scope_predicate(scope: Scope) -> Predicate {
    Predicate::new(move |e| match e.deployment() {
        Some(d) => scope_matches(&scope, d),
        None => true,
    })
}

fn scope_matches(scope: &Scope, d: &Deployment) -> bool {
    if let Some(cluster) = &scope.cluster {
        if cluster != &d.cluster_name && cluster != &d.cluster_id {
            return false;
        }
    }
    if let Some(namespace) = &scope.namespace {
        if namespace != &d.namespace {
            return false;
        }
    }
    if let Some(label) = &scope.label {
        match d.labels.get(&label.key) {
            Some(value) => {
                if label.value.as_ref().is_some_and(|want| want != value) {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

fn deployment_exclusion(exclusion: DeploymentExclusion) -> Predicate {
    Predicate::new(move |e| {
        let Some(d) = e.deployment() else {
            return false;
        };
        let name_ok = exclusion.name.as_ref().map_or(true, |n| n == &d.name);
        let scope_ok = exclusion
            .scope
            .as_ref()
            .map_or(true, |s| scope_matches(s, d));
        name_ok && scope_ok
    })
}

/// Images are excluded by name prefix; a deployment only when all of its
/// images are.
fn image_exclusion(exclusion: ImageExclusion) -> Predicate {
    Predicate::new(move |e| {
        let is_excluded = |full_name: &str| full_name.starts_with(&exclusion.name);
        match e {
            EntityRef::Image(image) => is_excluded(&image.name.full_name),
            _ => {
                let images = e.container_images();
                !images.is_empty() && images.iter().all(|r| is_excluded(&r.image.name.full_name))
            }
        }
    })
}
