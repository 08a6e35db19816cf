//! Policy compilation.
//!
//! Turns a [`Policy`] document into a [`CompiledPolicy`]: the AND of every
//! field criterion it names, gated by its applicability predicate. Compilation
//! is pure; the same document always compiles to matchers with identical
//! behaviour, and a failure leaves nothing behind.

mod exclusions;
pub(crate) mod fields;

use std::sync::Arc;

use stackwatch_core::{EnforcementAction, LifecycleStage, Policy, Violation};

use crate::combinators::{must_violate_all, MatchCache, Matcher, Predicate};
use crate::entity::EntityRef;
use crate::error::{CompileError, DetectionError, Result};
use crate::search::{self, Query, ValueMatch};

/// A policy paired with its executable predicate and matcher.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    policy: Arc<Policy>,
    predicate: Option<Predicate>,
    matcher: Matcher,
    query: Query,
}

impl CompiledPolicy {
    /// Assemble a compiled policy from already-built parts.
    pub fn from_parts(
        policy: Policy,
        predicate: Option<Predicate>,
        matcher: Matcher,
        query: Query,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            predicate,
            matcher,
            query,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn id(&self) -> &str {
        &self.policy.id
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    /// Violation matcher, already gated by the predicate.
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Index query selecting candidate deployments.
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn applies_to(&self, entity: &EntityRef<'_>) -> bool {
        self.predicate.as_ref().map_or(true, |p| p.test(entity))
    }

    /// Run the matcher, attaching policy and entity context to failures.
    pub fn violations(
        &self,
        entity: &EntityRef<'_>,
        cache: &mut MatchCache,
    ) -> Result<Vec<Violation>> {
        self.matcher
            .run(entity, cache)
            .map_err(|e| e.in_match(&self.policy.name, &entity.describe()))
    }
}

/// Compile `policy`, validating it first.
pub fn compile(policy: &Policy) -> Result<CompiledPolicy> {
    compile_inner(policy).map_err(|source| DetectionError::Compile {
        policy: policy.name.clone(),
        source,
    })
}

fn compile_inner(policy: &Policy) -> std::result::Result<CompiledPolicy, CompileError> {
    validate(policy)?;

    let mut matcher: Option<Matcher> = None;
    for (_, compile_field) in fields::FIELD_COMPILERS {
        let compiled = compile_field(&policy.fields)?;
        matcher = must_violate_all(matcher, compiled);
    }

    let predicate = exclusions::compile_predicate(policy);
    let matcher = matcher
        .unwrap_or_else(Matcher::none)
        .process_if(predicate.clone());
    let query = build_query(policy)?;

    Ok(CompiledPolicy::from_parts(
        policy.clone(),
        predicate,
        matcher,
        query,
    ))
}

fn validate(policy: &Policy) -> std::result::Result<(), CompileError> {
    if policy.lifecycle_stages.is_empty() {
        return Err(CompileError::MissingLifecycleStage);
    }
    if policy.fields.process_policy.is_some() && !policy.applies_at(LifecycleStage::Runtime) {
        return Err(CompileError::InvalidField {
            field: "processPolicy",
            reason: "requires the RUNTIME lifecycle stage".to_string(),
        });
    }
    let build_only = policy
        .lifecycle_stages
        .iter()
        .all(|s| *s == LifecycleStage::Build);
    if build_only {
        if let Some(field) = fields::deployment_only_criteria(&policy.fields).first() {
            return Err(CompileError::InvalidField {
                field: *field,
                reason: "cannot be evaluated at the BUILD lifecycle stage".to_string(),
            });
        }
    }
    for action in &policy.enforcement_actions {
        if *action == EnforcementAction::Unset {
            continue;
        }
        if let Some(stage) = action.stage() {
            if !policy.applies_at(stage) {
                return Err(CompileError::InvalidField {
                    field: "enforcementActions",
                    reason: format!("{action} requires the {stage} lifecycle stage"),
                });
            }
        }
    }
    Ok(())
}

/// Conjunction of the indexable criteria. Always at least as permissive as
/// the matcher, so index hits are a superset of violating deployments.
fn build_query(policy: &Policy) -> std::result::Result<Query, CompileError> {
    let mut query = Query::all();
    if let Some(image) = &policy.fields.image_name {
        for (field, pattern) in [
            (search::IMAGE_REGISTRY, &image.registry),
            (search::IMAGE_REMOTE, &image.remote),
            (search::IMAGE_TAG, &image.tag),
        ] {
            if let Some(pattern) = pattern {
                let re = fields::compile_regex("imageName", pattern)?;
                query = query.with(field, ValueMatch::Regex(re));
            }
        }
    }
    if let Some(privileged) = policy.fields.privileged {
        query = query.with(
            search::CONTAINER_PRIVILEGED,
            ValueMatch::Exact(privileged.to_string()),
        );
    }
    let namespaces: Option<Vec<String>> = policy
        .scope
        .iter()
        .map(|s| s.namespace.clone())
        .collect();
    if let Some(namespaces) = namespaces.filter(|n| !n.is_empty()) {
        query = query.with(search::DEPLOYMENT_NAMESPACE, ValueMatch::AnyOf(namespaces));
    }
    Ok(query)
}
