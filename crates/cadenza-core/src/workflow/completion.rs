//! Step outcome application: the first half of the completion service.
//!
//! `apply_step_outcome` records a reported result against a step --
//! requeueing it through the retry machinery when an error arrives with
//! budget left, failing it terminally when the budget is spent, or
//! marking it COMPLETED with its outputs. The engine layers persistence,
//! audit, events and callbacks on top of the returned `StepOutcome`.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;

use cadenza_types::workflow::{BackoffStrategy, StepStatus, WorkflowStep};

use super::retry::{RetryDecision, apply_retry_transition};

/// What happened to the step when its result was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step failed but was requeued; no completion events follow.
    Requeued(RetryDecision),
    /// The step failed terminally.
    Failed,
    /// The step completed successfully.
    Completed,
}

impl StepOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, StepOutcome::Completed)
    }
}

/// Apply a completion report to a step.
///
/// On error with retry budget remaining, the step goes back to PENDING
/// (see `retry::apply_retry_transition`) and the outputs are discarded.
/// On terminal failure the error and completion time are recorded. On
/// success the outputs are recorded and the step is COMPLETED.
pub fn apply_step_outcome(
    step: &mut WorkflowStep,
    outputs: HashMap<String, Value>,
    error: Option<&str>,
    default_backoff: BackoffStrategy,
    default_backoff_base: f64,
) -> StepOutcome {
    if let Some(error) = error {
        let decision =
            apply_retry_transition(step, error, default_backoff, default_backoff_base);
        if decision.will_retry {
            return StepOutcome::Requeued(decision);
        }
        step.error = Some(error.to_string());
        step.completed_at = Some(Utc::now());
        return StepOutcome::Failed;
    }

    step.status = StepStatus::Completed;
    step.completed_at = Some(Utc::now());
    step.outputs = outputs;
    step.error = None;
    StepOutcome::Completed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
