//! Dry-run simulation: validate a definition and predict the execution
//! flow without touching storage.
//!
//! Each non-router step yields one `RUN`/`SKIP` line based on static
//! evaluation of its condition in an empty context: a condition that
//! references runtime variables cannot be decided statically and is
//! reported as RUN; a condition that evaluates cleanly is decided by
//! truthiness; anything else is reported as SKIP. Router steps are
//! omitted from the trace.

use std::path::Path;

use serde_json::{Value, json};

use cadenza_types::workflow::DryRunReport;

use super::definition::{condition_parses, resolve_steps, validate_document};
use super::expression::{ConditionEvaluator, value_to_bool};

/// Validate a definition document and simulate its predicted step flow.
pub fn dry_run(data: &Value, tier: &str, workspace_root: Option<&Path>) -> DryRunReport {
    let (errors, _warnings) = validate_document(data, tier, workspace_root);

    let mut predicted_flow = Vec::new();
    let evaluator = ConditionEvaluator::new();

    for (pos, step) in resolve_steps(data, tier).iter().enumerate() {
        let Some(_) = step.as_object() else {
            continue;
        };
        let agent_type = step.get("agent_type").and_then(Value::as_str).unwrap_or("");
        let is_router = agent_type == "router"
            || step
                .get("routes")
                .and_then(Value::as_array)
                .is_some_and(|r| !r.is_empty());
        if is_router {
            continue;
        }

        let label = step
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| step.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("step_{}", pos + 1));

        let Some(condition) = step.get("condition").and_then(Value::as_str) else {
            predicted_flow.push(format!("RUN  {label} ({agent_type})"));
            continue;
        };

        let status = match static_condition_outcome(&evaluator, condition) {
            StaticOutcome::Run => "RUN ",
            StaticOutcome::Skip => "SKIP",
        };
        predicted_flow.push(format!("{status} {label} ({agent_type}) [condition: {condition}]"));
    }

    DryRunReport {
        errors,
        predicted_flow,
    }
}

enum StaticOutcome {
    Run,
    Skip,
}

/// Decide a condition against an empty context.
///
/// Malformed conditions are SKIP. Conditions referencing identifiers
/// that only exist at runtime cannot be decided and default to RUN;
/// decidable conditions follow their truthiness; any other evaluation
/// failure is SKIP.
fn static_condition_outcome(evaluator: &ConditionEvaluator, condition: &str) -> StaticOutcome {
    if !condition_parses(condition) {
        return StaticOutcome::Skip;
    }
    if references_unknown_identifiers(condition) {
        return StaticOutcome::Run;
    }
    match evaluator.evaluate_value(condition, &json!({})) {
        Ok(value) if value_to_bool(&value) => StaticOutcome::Run,
        Ok(_) => StaticOutcome::Skip,
        Err(_) => StaticOutcome::Skip,
    }
}

/// Scan for root identifiers that are not expression keywords. In an
/// empty context every such identifier is unknown.
fn references_unknown_identifiers(condition: &str) -> bool {
    const KEYWORDS: [&str; 6] = ["true", "false", "null", "in", "and", "or"];

    let bytes = condition.as_bytes();
    let mut i = 0;
    let mut prev_non_space = 0u8;
    while i < bytes.len() {
        let c = bytes[i] as char;
        // skip string literals
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            while i < bytes.len() && bytes[i] as char != quote {
                i += 1;
            }
            i += 1;
            prev_non_space = quote as u8;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_alphanumeric() || c == '_' {
                    i += 1;
                } else {
                    break;
                }
            }
            let token = &condition[start..i];
            // property accesses (.foo) are not root identifiers
            if prev_non_space != b'.' && !KEYWORDS.contains(&token) {
                return true;
            }
            prev_non_space = b'x';
            continue;
        }
        if !c.is_ascii_whitespace() {
            prev_non_space = bytes[i];
        }
        i += 1;
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_and_simulates() {
        let data = json!({
            "name": "wf",
            "steps": [
                {"id": "s1", "name": "Design", "agent_type": "designer"},
                {"id": "s2", "name": "Router", "agent_type": "router"},
                {"id": "s3", "name": "Build", "agent_type": "developer", "condition": "true"},
                {"id": "s4", "name": "Bad", "condition": "x ==="},
            ],
        });

        let report = dry_run(&data, "", None);

        assert!(report.errors.iter().any(|e| e.contains("agent_type")));
        assert!(report.errors.iter().any(|e| e.contains("malformed")));
        assert_eq!(report.predicted_flow[0], "RUN  Design (designer)");
        assert!(
            report
                .predicted_flow
                .iter()
                .any(|l| l.starts_with("RUN  Build (developer)"))
        );
        // the router never appears in the trace
        assert!(!report.predicted_flow.iter().any(|l| l.contains("Router")));
    }

    #[test]
    fn runtime_conditions_predict_run() {
        let data = json!({
            "name": "wf",
            "steps": [{
                "id": "design",
                "agent_type": "designer",
                "condition": "result.tier == 'high'",
            }],
        });
        let report = dry_run(&data, "", None);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.predicted_flow[0].starts_with("RUN "), "{:?}", report.predicted_flow);
        assert!(report.predicted_flow[0].contains("[condition: result.tier == 'high']"));
    }

    #[test]
    fn static_false_condition_predicts_skip() {
        let data = json!({
            "name": "wf",
            "steps": [
                {"id": "a", "agent_type": "x", "condition": "false"},
                {"id": "b", "agent_type": "y", "condition": "1 == 2"},
            ],
        });
        let report = dry_run(&data, "", None);
        assert!(report.predicted_flow[0].starts_with("SKIP"));
        assert!(report.predicted_flow[1].starts_with("SKIP"));
    }

    #[test]
    fn malformed_condition_predicts_skip() {
        let data = json!({
            "name": "wf",
            "steps": [{"id": "a", "agent_type": "x", "condition": "tier ==="}],
        });
        let report = dry_run(&data, "", None);
        assert!(!report.is_valid());
        assert!(report.predicted_flow[0].starts_with("SKIP"));
    }

    #[test]
    fn non_mapping_document_reports_single_error() {
        let report = dry_run(&json!([1, 2]), "", None);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("must be a mapping"));
        assert!(report.predicted_flow.is_empty());
    }

    #[test]
    fn identifier_scan_ignores_strings_and_keywords() {
        assert!(!references_unknown_identifiers("true"));
        assert!(!references_unknown_identifiers("'tier' == 'tier'"));
        assert!(!references_unknown_identifiers("1 == 2"));
        assert!(references_unknown_identifiers("tier == 'high'"));
        assert!(references_unknown_identifiers("result.tier == 'high'"));
        assert!(references_unknown_identifiers("a && b"));
    }
}
