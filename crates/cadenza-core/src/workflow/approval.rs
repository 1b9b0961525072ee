//! Approval-gate enforcement for workflow steps.
//!
//! Gates do two things: inject their constraint messages into the prompt
//! the agent receives, and veto operations matching their tool
//! restrictions. The launcher is expected to call `constraints_for_prompt`
//! when composing a gated step's prompt and `operation_allowed` before
//! executing restricted commands on the agent's behalf.

use cadenza_types::workflow::{ApprovalGateKind, WorkflowStep};

/// Apply approval-gate constraints to an agent prompt.
///
/// Constraint messages from all required gates are appended after the
/// main instructions. Steps without gates return the prompt unchanged.
pub fn constraints_for_prompt(step: &WorkflowStep, base_prompt: &str) -> String {
    let constraints = step.approval_constraints();
    if constraints.is_empty() {
        return base_prompt.to_string();
    }

    tracing::info!(
        step_num = step.step_num,
        step = step.name.as_str(),
        gates = step.approval_gates.len(),
        "applied approval gate constraints to prompt"
    );

    format!("{base_prompt}\n\n{constraints}")
}

/// Whether an attempted operation is allowed under the step's gates.
///
/// An operation is blocked when any required gate's tool restriction is
/// a case-insensitive substring of it.
pub fn operation_allowed(step: &WorkflowStep, operation: &str) -> bool {
    let operation_lc = operation.to_lowercase();
    for restriction in step.tool_restrictions() {
        if operation_lc.contains(&restriction.to_lowercase()) {
            tracing::warn!(
                step_num = step.step_num,
                operation,
                restriction = restriction.as_str(),
                "operation blocked by approval gate"
            );
            return false;
        }
    }
    true
}

/// Human-readable summary of the active gates on a step, or None when
/// no required gate is attached.
pub fn gate_summary(step: &WorkflowStep) -> Option<String> {
    let kinds: Vec<&str> = step
        .approval_gates
        .iter()
        .filter(|g| g.required)
        .map(|g| match g.kind {
            ApprovalGateKind::PrMerge => "pr_merge",
            ApprovalGateKind::Deployment => "deployment",
            ApprovalGateKind::DataAccess => "data_access",
            ApprovalGateKind::Custom => "custom",
        })
        .collect();
    if kinds.is_empty() {
        None
    } else {
        Some(format!("Active approval gates: {}", kinds.join(", ")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_types::workflow::{Agent, ApprovalGate};

    fn gated_step() -> WorkflowStep {
        let agent = Agent {
            name: "developer".to_string(),
            display_name: "Developer".to_string(),
            description: String::new(),
            provider_preference: None,
            timeout_secs: 600,
            max_retries: 2,
        };
        let mut step = WorkflowStep::new(2, "develop", agent, "implement the fix");
        step.approval_gates.push(ApprovalGate::pr_merge_gate());
        step
    }

    #[test]
    fn prompt_gains_constraint_block() {
        let step = gated_step();
        let prompt = constraints_for_prompt(&step, "Fix the bug in parser.rs");
        assert!(prompt.starts_with("Fix the bug in parser.rs"));
        assert!(prompt.contains("PR MERGE APPROVAL POLICY"));
    }

    #[test]
    fn ungated_prompt_is_unchanged() {
        let mut step = gated_step();
        step.approval_gates.clear();
        assert_eq!(constraints_for_prompt(&step, "base"), "base");
    }

    #[test]
    fn restricted_operations_are_blocked() {
        let step = gated_step();
        assert!(!operation_allowed(&step, "gh pr merge 17 --squash"));
        assert!(!operation_allowed(&step, "GH PR MERGE 17"));
        assert!(operation_allowed(&step, "gh pr create --fill"));
        assert!(operation_allowed(&step, "git push origin feature/fix"));
    }

    #[test]
    fn summary_lists_active_gate_kinds() {
        let step = gated_step();
        assert_eq!(
            gate_summary(&step).as_deref(),
            Some("Active approval gates: pr_merge")
        );

        let mut ungated = gated_step();
        ungated.approval_gates[0].required = false;
        assert!(gate_summary(&ungated).is_none());
    }
}
