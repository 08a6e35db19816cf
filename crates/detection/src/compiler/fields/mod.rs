//! Field compilers: one per supported policy criterion.
//!
//! Each returns `Ok(None)` when the policy has no criterion of its kind. The
//! order of [`FIELD_COMPILERS`] is the order violations are reported in.

mod container;
mod deployment;
mod image;
mod process;

use regex::Regex;

use stackwatch_core::{Container, PolicyFields, Violation};

use crate::combinators::{MatchCache, Matcher};
use crate::entity::RunningImage;
use crate::error::CompileError;

pub(crate) type FieldCompiler = fn(&PolicyFields) -> Result<Option<Matcher>, CompileError>;

/// Registered field compilers, in evaluation order.
pub(crate) const FIELD_COMPILERS: &[(&str, FieldCompiler)] = &[
    ("imageName", image::image_name),
    ("imageAgeDays", image::image_age),
    ("scanAgeDays", image::scan_age),
    ("unscannedImage", image::unscanned_image),
    ("cvss", image::cvss),
    ("cve", image::cve),
    ("component", image::component),
    ("env", container::env),
    ("command", container::command),
    ("args", container::args),
    ("volumePolicy", container::volume),
    ("portPolicy", container::port),
    ("requiredLabel", deployment::required_label),
    ("requiredAnnotation", deployment::required_annotation),
    ("privileged", container::privileged),
    ("readOnlyRootFs", container::read_only_root_fs),
    ("addCapabilities", container::add_capabilities),
    ("dropCapabilities", container::drop_capabilities),
    ("containerResources", container::resources),
    ("permissionPolicy", deployment::permission),
    ("processPolicy", process::process),
];

/// Criteria that need a deployment and cannot be evaluated against a bare image.
pub(crate) fn deployment_only_criteria(fields: &PolicyFields) -> Vec<&'static str> {
    let mut names = Vec::new();
    let mut check = |present: bool, name: &'static str| {
        if present {
            names.push(name);
        }
    };
    check(fields.env.is_some(), "env");
    check(fields.command.is_some(), "command");
    check(fields.args.is_some(), "args");
    check(fields.volume_policy.is_some(), "volumePolicy");
    check(fields.port_policy.is_some(), "portPolicy");
    check(fields.required_label.is_some(), "requiredLabel");
    check(fields.required_annotation.is_some(), "requiredAnnotation");
    check(fields.privileged.is_some(), "privileged");
    check(fields.read_only_root_fs.is_some(), "readOnlyRootFs");
    check(!fields.add_capabilities.is_empty(), "addCapabilities");
    check(!fields.drop_capabilities.is_empty(), "dropCapabilities");
    check(fields.container_resources.is_some(), "containerResources");
    check(fields.permission_policy.is_some(), "permissionPolicy");
    check(fields.process_policy.is_some(), "processPolicy");
    names
}

// ── Helpers ─────────────────────────────────────────────────────────

pub(crate) fn compile_regex(field: &'static str, pattern: &str) -> Result<Regex, CompileError> {
    Regex::new(pattern).map_err(|source| CompileError::InvalidRegex {
        field,
        pattern: pattern.to_string(),
        source,
    })
}

pub(crate) fn optional_regex(
    field: &'static str,
    pattern: Option<&String>,
) -> Result<Option<Regex>, CompileError> {
    pattern.map(|p| compile_regex(field, p)).transpose()
}

/// An absent pattern matches anything.
fn matches_opt(re: &Option<Regex>, value: &str) -> bool {
    re.as_ref().map_or(true, |re| re.is_match(value))
}

/// Matcher evaluating `f` on every container of the entity.
fn per_container<F>(f: F) -> Matcher
where
    F: Fn(&Container) -> Vec<Violation> + Send + Sync + 'static,
{
    Matcher::new(move |entity, _| Ok(entity.containers().iter().flat_map(&f).collect()))
}

/// Matcher evaluating `f` on every image the entity runs.
fn per_image<F>(f: F) -> Matcher
where
    F: Fn(&RunningImage<'_>, &mut MatchCache) -> Vec<Violation> + Send + Sync + 'static,
{
    Matcher::new(move |entity, cache| {
        let mut violations = Vec::new();
        for running in entity.container_images() {
            violations.extend(f(&running, cache));
        }
        Ok(violations)
    })
}

fn image_label(running: &RunningImage<'_>) -> String {
    match running.container {
        Some(c) => format!("Container '{}' image '{}'", c.name, running.image.name),
        None => format!("Image '{}'", running.image.name),
    }
}

#[cfg(test)]
mod tests;
