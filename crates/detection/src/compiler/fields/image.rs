use chrono::{DateTime, Duration, Utc};

use stackwatch_core::{PolicyFields, Violation};

use super::{compile_regex, image_label, matches_opt, optional_regex, per_image};
use crate::combinators::Matcher;
use crate::error::CompileError;

pub(super) fn image_name(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = &fields.image_name else {
        return Ok(None);
    };
    if policy.registry.is_none() && policy.remote.is_none() && policy.tag.is_none() {
        return Err(CompileError::InvalidField {
            field: "imageName",
            reason: "at least one of registry, remote or tag is required".to_string(),
        });
    }
    let registry = optional_regex("imageName.registry", policy.registry.as_ref())?;
    let remote = optional_regex("imageName.remote", policy.remote.as_ref())?;
    let tag = optional_regex("imageName.tag", policy.tag.as_ref())?;

    let mut criteria = Vec::new();
    for (part, pattern) in [
        ("registry", &policy.registry),
        ("remote", &policy.remote),
        ("tag", &policy.tag),
    ] {
        if let Some(p) = pattern {
            criteria.push(format!("{part}='{p}'"));
        }
    }
    let criteria = criteria.join(", ");

    Ok(Some(per_image(move |running, _| {
        let name = &running.image.name;
        if matches_opt(&registry, &name.registry)
            && matches_opt(&remote, &name.remote)
            && matches_opt(&tag, &name.tag)
        {
            vec![Violation::new(
                "Image name",
                format!("{} matches {}", image_label(running), criteria),
            )
            .with_evidence(name.full_name.clone())]
        } else {
            Vec::new()
        }
    })))
}

pub(super) fn image_age(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(days) = fields.image_age_days else {
        return Ok(None);
    };
    let max_age = age_limit("imageAgeDays", days)?;
    Ok(Some(per_image(move |running, _| {
        let created = running.image.metadata.as_ref().and_then(|m| m.created);
        match created {
            Some(created) if older_than(created, max_age) => {
                vec![Violation::new(
                    "Image age",
                    format!(
                        "{} was created more than {days} days ago",
                        image_label(running)
                    ),
                )
                .with_evidence(created.to_rfc3339())]
            }
            _ => Vec::new(),
        }
    })))
}

pub(super) fn scan_age(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(days) = fields.scan_age_days else {
        return Ok(None);
    };
    let max_age = age_limit("scanAgeDays", days)?;
    Ok(Some(per_image(move |running, _| match &running.image.scan {
        Some(scan) if older_than(scan.scan_time, max_age) => {
            vec![Violation::new(
                "Image scan age",
                format!(
                    "{} was last scanned more than {days} days ago",
                    image_label(running)
                ),
            )
            .with_evidence(scan.scan_time.to_rfc3339())]
        }
        _ => Vec::new(),
    })))
}

/// Validate a day count and turn it into a span that can be subtracted from
/// the current time.
fn age_limit(field: &'static str, days: i64) -> Result<Duration, CompileError> {
    if days < 0 {
        return Err(CompileError::InvalidField {
            field,
            reason: format!("must not be negative, got {days}"),
        });
    }
    Duration::try_days(days)
        .filter(|span| Utc::now().checked_sub_signed(*span).is_some())
        .ok_or_else(|| CompileError::InvalidField {
            field,
            reason: format!("{days} days is out of range"),
        })
}

fn older_than(at: DateTime<Utc>, max_age: Duration) -> bool {
    Utc::now()
        .checked_sub_signed(max_age)
        .is_some_and(|cutoff| at < cutoff)
}

pub(super) fn unscanned_image(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    if fields.unscanned_image != Some(true) {
        return Ok(None);
    }
    Ok(Some(per_image(|running, _| {
        if running.image.scan.is_none() {
            vec![Violation::new(
                "Image scan",
                format!("{} has not been scanned", image_label(running)),
            )]
        } else {
            Vec::new()
        }
    })))
}

pub(super) fn cvss(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = fields.cvss else {
        return Ok(None);
    };
    if !(0.0..=10.0).contains(&policy.value) {
        return Err(CompileError::InvalidField {
            field: "cvss",
            reason: format!("threshold must be between 0 and 10, got {}", policy.value),
        });
    }
    Ok(Some(per_image(move |running, cache| {
        match cache.max_cvss(&running.image) {
            Some(score) if policy.op.matches(score, policy.value) => {
                vec![Violation::new(
                    "CVSS",
                    format!(
                        "Found a CVSS score of {score} ({} {}) in {}",
                        policy.op.symbol(),
                        policy.value,
                        image_label(running)
                    ),
                )
                .with_evidence(score.to_string())]
            }
            _ => Vec::new(),
        }
    })))
}

pub(super) fn cve(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(pattern) = &fields.cve else {
        return Ok(None);
    };
    let re = compile_regex("cve", pattern)?;
    Ok(Some(per_image(move |running, _| {
        let Some(scan) = &running.image.scan else {
            return Vec::new();
        };
        scan.components
            .iter()
            .flat_map(|c| c.vulns.iter().map(move |v| (c, v)))
            .filter(|(_, v)| re.is_match(&v.cve))
            .map(|(c, v)| {
                Violation::new(
                    "CVE",
                    format!(
                        "{} (CVSS {}) found in component '{}' of {}",
                        v.cve,
                        v.cvss,
                        c.name,
                        image_label(running)
                    ),
                )
                .with_evidence(v.cve.clone())
            })
            .collect()
    })))
}

pub(super) fn component(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = &fields.component else {
        return Ok(None);
    };
    if policy.name.is_none() && policy.version.is_none() {
        return Err(CompileError::InvalidField {
            field: "component",
            reason: "name or version is required".to_string(),
        });
    }
    let name = optional_regex("component.name", policy.name.as_ref())?;
    let version = optional_regex("component.version", policy.version.as_ref())?;
    Ok(Some(per_image(move |running, _| {
        let Some(scan) = &running.image.scan else {
            return Vec::new();
        };
        scan.components
            .iter()
            .filter(|c| matches_opt(&name, &c.name) && matches_opt(&version, &c.version))
            .map(|c| {
                Violation::new(
                    "Image component",
                    format!(
                        "Component '{} {}' present in {}",
                        c.name,
                        c.version,
                        image_label(running)
                    ),
                )
                .with_evidence(format!("{}@{}", c.name, c.version))
            })
            .collect()
    })))
}
