use std::collections::BTreeMap;

use regex::Regex;

use stackwatch_core::{KeyValuePolicy, PolicyFields, Violation};

use super::{matches_opt, optional_regex};
use crate::combinators::Matcher;
use crate::error::CompileError;

pub(super) fn required_label(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    required_key_value(fields.required_label.as_ref(), "requiredLabel", "label", |d| {
        &d.labels
    })
}

pub(super) fn required_annotation(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    required_key_value(
        fields.required_annotation.as_ref(),
        "requiredAnnotation",
        "annotation",
        |d| &d.annotations,
    )
}

/// Violated when no entry of the map satisfies both key and value patterns.
fn required_key_value(
    policy: Option<&KeyValuePolicy>,
    field: &'static str,
    noun: &'static str,
    map: fn(&stackwatch_core::Deployment) -> &BTreeMap<String, String>,
) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    let Some(key_pattern) = policy.key.clone() else {
        return Err(CompileError::InvalidField {
            field,
            reason: "key is required".to_string(),
        });
    };
    let key: Option<Regex> = optional_regex(field, Some(&key_pattern))?;
    let value = optional_regex(field, policy.value.as_ref())?;
    let described = match &policy.value {
        Some(v) => format!("{key_pattern}={v}"),
        None => key_pattern,
    };

    Ok(Some(Matcher::new(move |entity, _| {
        let Some(deployment) = entity.deployment() else {
            return Ok(Vec::new());
        };
        let found = map(deployment)
            .iter()
            .any(|(k, v)| matches_opt(&key, k) && matches_opt(&value, v));
        if found {
            Ok(Vec::new())
        } else {
            Ok(vec![Violation::new(
                format!("Required {noun}"),
                format!("Required {noun} not found (found no {noun} matching '{described}')"),
            )])
        }
    })))
}

pub(super) fn permission(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = fields.permission_policy else {
        return Ok(None);
    };
    Ok(Some(Matcher::new(move |entity, _| {
        let Some(deployment) = entity.deployment() else {
            return Ok(Vec::new());
        };
        let level = deployment.service_account_permission_level;
        if level >= policy.permission_level {
            Ok(vec![Violation::new(
                "RBAC permission level",
                format!(
                    "Service account '{}' has permission level {level:?}, at least {:?}",
                    deployment.service_account, policy.permission_level
                ),
            )])
        } else {
            Ok(Vec::new())
        }
    })))
}
