use stackwatch_core::{PolicyFields, Violation};

use super::{matches_opt, optional_regex};
use crate::combinators::Matcher;
use crate::error::CompileError;

/// Matches process events; every present sub-criterion must hold.
pub(super) fn process(fields: &PolicyFields) -> Result<Option<Matcher>, CompileError> {
    let Some(policy) = &fields.process_policy else {
        return Ok(None);
    };
    if policy.name.is_none() && policy.args.is_none() && policy.ancestor.is_none() && policy.uid.is_none() {
        return Err(CompileError::InvalidField {
            field: "processPolicy",
            reason: "at least one of name, args, ancestor or uid is required".to_string(),
        });
    }
    let name = optional_regex("processPolicy.name", policy.name.as_ref())?;
    let args = optional_regex("processPolicy.args", policy.args.as_ref())?;
    let ancestor = optional_regex("processPolicy.ancestor", policy.ancestor.as_ref())?;
    let uid = policy.uid;

    Ok(Some(Matcher::new(move |entity, _| {
        let Some(indicator) = entity.indicator() else {
            return Ok(Vec::new());
        };
        let signal = &indicator.signal;
        let ancestor_ok = match &ancestor {
            Some(re) => signal.lineage.iter().any(|p| re.is_match(p)),
            None => true,
        };
        if matches_opt(&name, &signal.name)
            && matches_opt(&args, &signal.args)
            && ancestor_ok
            && uid.map_or(true, |u| u == signal.uid)
        {
            Ok(vec![Violation::new(
                "Process",
                format!(
                    "Binary '{}' executed with arguments '{}' under user ID {} in container '{}'",
                    signal.exec_file_path, signal.args, signal.uid, indicator.container_name
                ),
            )
            .with_evidence(signal.name.clone())])
        } else {
            Ok(Vec::new())
        }
    })))
}
