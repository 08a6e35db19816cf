use stackwatch_core::{NumericalPolicy, PolicyFields, Resources, Violation};

use super::{compile_regex, matches_opt, optional_regex, per_container};
use crate::combinators::Matcher;
use crate::error::CompileError;

type ResourceGetter = fn(&Resources) -> f32;

pub(super) fn env(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = &fields.env else {
        return Ok(None);
    };
    if policy.key.is_none() && policy.value.is_none() {
        return Err(CompileError::InvalidField {
            field: "env",
            reason: "key or value is required".to_string(),
        });
    }
    let key = optional_regex("env.key", policy.key.as_ref())?;
    let value = optional_regex("env.value", policy.value.as_ref())?;
    Ok(Some(per_container(move |c| {
        c.config
            .env
            .iter()
            .filter(|e| matches_opt(&key, &e.key) && matches_opt(&value, &e.value))
            .map(|e| {
                Violation::new(
                    "Environment variable",
                    format!("Container '{}' has environment variable '{}'", c.name, e.key),
                )
                .with_evidence(format!("{}={}", e.key, e.value))
            })
            .collect()
    })))
}

pub(super) fn command(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(pattern) = &fields.command else {
        return Ok(None);
    };
    let re = compile_regex("command", pattern)?;
    Ok(Some(per_container(move |c| {
        let command = c.config.command.join(" ");
        if !command.is_empty() && re.is_match(&command) {
            vec![Violation::new(
                "Command",
                format!("Container '{}' runs command '{command}'", c.name),
            )
            .with_evidence(command)]
        } else {
            Vec::new()
        }
    })))
}

pub(super) fn args(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(pattern) = &fields.args else {
        return Ok(None);
    };
    let re = compile_regex("args", pattern)?;
    Ok(Some(per_container(move |c| {
        let args = c.config.args.join(" ");
        if !args.is_empty() && re.is_match(&args) {
            vec![Violation::new(
                "Arguments",
                format!("Container '{}' has arguments '{args}'", c.name),
            )
            .with_evidence(args)]
        } else {
            Vec::new()
        }
    })))
}

pub(super) fn volume(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = &fields.volume_policy else {
        return Ok(None);
    };
    let name = optional_regex("volumePolicy.name", policy.name.as_ref())?;
    let source = optional_regex("volumePolicy.source", policy.source.as_ref())?;
    let destination = optional_regex("volumePolicy.destination", policy.destination.as_ref())?;
    let volume_type = optional_regex("volumePolicy.type", policy.volume_type.as_ref())?;
    let read_only = policy.read_only;
    Ok(Some(per_container(move |c| {
        c.volumes
            .iter()
            .filter(|v| {
                matches_opt(&name, &v.name)
                    && matches_opt(&source, &v.source)
                    && matches_opt(&destination, &v.destination)
                    && matches_opt(&volume_type, &v.volume_type)
                    && read_only.map_or(true, |ro| ro == v.read_only)
            })
            .map(|v| {
                Violation::new(
                    "Volume",
                    format!(
                        "Container '{}' mounts volume '{}' ({}) at '{}'",
                        c.name, v.name, v.source, v.destination
                    ),
                )
                .with_evidence(v.name.clone())
            })
            .collect()
    })))
}

pub(super) fn port(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = fields.port_policy.clone() else {
        return Ok(None);
    };
    if policy.port.is_none() && policy.protocol.is_none() {
        return Err(CompileError::InvalidField {
            field: "portPolicy",
            reason: "port or protocol is required".to_string(),
        });
    }
    Ok(Some(per_container(move |c| {
        c.ports
            .iter()
            .filter(|p| {
                policy.port.map_or(true, |port| port == p.container_port)
                    && policy
                        .protocol
                        .as_ref()
                        .map_or(true, |proto| proto.eq_ignore_ascii_case(&p.protocol))
            })
            .map(|p| {
                Violation::new(
                    "Port",
                    format!(
                        "Container '{}' exposes port {}/{}",
                        c.name, p.container_port, p.protocol
                    ),
                )
                .with_evidence(p.container_port.to_string())
            })
            .collect()
    })))
}

pub(super) fn privileged(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(wanted) = fields.privileged else {
        return Ok(None);
    };
    Ok(Some(per_container(move |c| {
        if c.security_context.privileged != wanted {
            return Vec::new();
        }
        let message = if wanted {
            format!("Container '{}' is privileged", c.name)
        } else {
            format!("Container '{}' is not privileged", c.name)
        };
        vec![Violation::new("Privileged", message).with_evidence(wanted.to_string())]
    })))
}

pub(super) fn read_only_root_fs(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(wanted) = fields.read_only_root_fs else {
        return Ok(None);
    };
    Ok(Some(per_container(move |c| {
        if c.security_context.read_only_root_filesystem != wanted {
            return Vec::new();
        }
        let message = if wanted {
            format!("Container '{}' uses a read-only root filesystem", c.name)
        } else {
            format!("Container '{}' uses a writable root filesystem", c.name)
        };
        vec![Violation::new("Read-only root filesystem", message)]
    })))
}

pub(super) fn add_capabilities(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    if fields.add_capabilities.is_empty() {
        return Ok(None);
    }
    let forbidden = fields.add_capabilities.clone();
    Ok(Some(per_container(move |c| {
        c.security_context
            .add_capabilities
            .iter()
            .filter(|cap| forbidden.iter().any(|f| f.eq_ignore_ascii_case(cap)))
            .map(|cap| {
                Violation::new(
                    "Add capabilities",
                    format!("Container '{}' adds capability {cap}", c.name),
                )
                .with_evidence(cap.clone())
            })
            .collect()
    })))
}

pub(super) fn drop_capabilities(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    if fields.drop_capabilities.is_empty() {
        return Ok(None);
    }
    let required = fields.drop_capabilities.clone();
    Ok(Some(per_container(move |c| {
        let missing: Vec<&String> = required
            .iter()
            .filter(|r| {
                !c.security_context
                    .drop_capabilities
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(r))
            })
            .collect();
        if missing.is_empty() {
            return Vec::new();
        }
        let list = missing
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        vec![Violation::new(
            "Drop capabilities",
            format!("Container '{}' does not drop expected capabilities: {list}", c.name),
        )
        .with_evidence(list)]
    })))
}

pub(super) fn resources(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = fields.container_resources.clone() else {
        return Ok(None);
    };
    let candidates: [(&'static str, Option<NumericalPolicy>, ResourceGetter); 4] = [
        ("CPU request", policy.cpu_request, |r| r.cpu_cores_request),
        ("CPU limit", policy.cpu_limit, |r| r.cpu_cores_limit),
        ("memory request", policy.memory_request, |r| r.memory_mb_request),
        ("memory limit", policy.memory_limit, |r| r.memory_mb_limit),
    ];
    let checks: Vec<(&'static str, NumericalPolicy, ResourceGetter)> = candidates
        .into_iter()
        .filter_map(|(name, criterion, get)| criterion.map(|c| (name, c, get)))
        .collect();
    if checks.is_empty() {
        return Err(CompileError::InvalidField {
            field: "containerResources",
            reason: "at least one request or limit comparison is required".to_string(),
        });
    }

    // Every present comparison must hold for the container to violate.
    Ok(Some(per_container(move |c| {
        let mut parts = Vec::with_capacity(checks.len());
        for (name, criterion, get) in &checks {
            let value = get(&c.resources);
            if !criterion.op.matches(value, criterion.value) {
                return Vec::new();
            }
            parts.push(format!(
                "{name} {value} {} {}",
                criterion.op.symbol(),
                criterion.value
            ));
        }
        vec![Violation::new(
            "Container resources",
            format!("Container '{}' has {}", c.name, parts.join(" and ")),
        )]
    })))
}
