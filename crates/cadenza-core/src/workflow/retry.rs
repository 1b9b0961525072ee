//! Retry and backoff handling for failed steps.
//!
//! Stateless: all logic lives in free functions taking configuration as
//! parameters. A failed step is either requeued (status back to PENDING,
//! retry counter incremented, next attempt delayed by the computed
//! backoff) or marked terminally FAILED once its retry budget is spent.

use cadenza_types::workflow::{BackoffStrategy, StepStatus, WorkflowStep};

/// Outcome of a retry decision for a failed step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    /// True when the step was requeued for another attempt.
    pub will_retry: bool,
    /// Seconds to wait before the next attempt; None on terminal failure.
    pub backoff_seconds: Option<f64>,
    /// The retry budget that applied to the decision.
    pub max_retries: u32,
}

/// Compute the delay in seconds before the next retry attempt.
///
/// - exponential: `default_base * 2^(retry_count - 1)`
/// - linear: `initial_delay * retry_count`
/// - constant: `initial_delay`
///
/// `retry_count` is the attempt about to be made (1-based).
pub fn compute_backoff_seconds(
    retry_count: u32,
    strategy: BackoffStrategy,
    initial_delay: f64,
    default_base: f64,
) -> f64 {
    match strategy {
        BackoffStrategy::Exponential => {
            default_base * f64::from(2u32.saturating_pow(retry_count.saturating_sub(1)))
        }
        BackoffStrategy::Linear => initial_delay * f64::from(retry_count),
        BackoffStrategy::Constant => initial_delay,
    }
}

/// Decide between requeue and terminal failure for a step that reported
/// an error.
///
/// If the step still has retry budget (`retry_count < effective max`),
/// it is reset to PENDING with completed-at and error cleared and the
/// retry counter incremented; the decision carries the backoff delay.
/// Otherwise the step is marked FAILED.
pub fn apply_retry_transition(
    step: &mut WorkflowStep,
    error: &str,
    default_backoff: BackoffStrategy,
    default_backoff_base: f64,
) -> RetryDecision {
    let max_retries = step.effective_max_retries(step.agent.max_retries);

    if step.retry_count < max_retries {
        step.status = StepStatus::Pending;
        step.completed_at = None;
        step.error = None;
        step.retry_count += 1;

        let strategy = step.backoff_strategy.unwrap_or(default_backoff);
        let backoff = compute_backoff_seconds(
            step.retry_count,
            strategy,
            step.initial_delay_secs,
            default_backoff_base,
        );

        tracing::info!(
            step = step.name.as_str(),
            retry_count = step.retry_count,
            max_retries,
            backoff_seconds = backoff,
            error,
            "requeueing failed step for retry"
        );

        RetryDecision {
            will_retry: true,
            backoff_seconds: Some(backoff),
            max_retries,
        }
    } else {
        step.status = StepStatus::Failed;

        tracing::warn!(
            step = step.name.as_str(),
            retry_count = step.retry_count,
            max_retries,
            error,
            "retry budget exhausted, step failed terminally"
        );

        RetryDecision {
            will_retry: false,
            backoff_seconds: None,
            max_retries,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_types::workflow::Agent;
    use chrono::Utc;

    fn make_step() -> WorkflowStep {
        let agent = Agent {
            name: "developer".to_string(),
            display_name: "Developer".to_string(),
            description: String::new(),
            provider_preference: None,
            timeout_secs: 600,
            max_retries: 2,
        };
        WorkflowStep::new(1, "develop", agent, "do it")
    }

    // -------------------------------------------------------------------
    // compute_backoff_seconds
    // -------------------------------------------------------------------

    #[test]
    fn backoff_strategies() {
        assert_eq!(
            compute_backoff_seconds(1, BackoffStrategy::Exponential, 0.0, 1.0),
            1.0
        );
        assert_eq!(
            compute_backoff_seconds(3, BackoffStrategy::Exponential, 0.0, 1.0),
            4.0
        );
        assert_eq!(
            compute_backoff_seconds(3, BackoffStrategy::Linear, 2.0, 1.0),
            6.0
        );
        assert_eq!(
            compute_backoff_seconds(2, BackoffStrategy::Constant, 3.0, 1.0),
            3.0
        );
    }

    #[test]
    fn exponential_backoff_scales_with_base() {
        assert_eq!(
            compute_backoff_seconds(4, BackoffStrategy::Exponential, 0.0, 2.5),
            20.0
        );
    }

    // -------------------------------------------------------------------
    // apply_retry_transition
    // -------------------------------------------------------------------

    #[test]
    fn requeues_step_until_limit() {
        let mut step = make_step();
        step.retry = Some(2);
        step.status = StepStatus::Running;
        step.completed_at = Some(Utc::now());
        step.error = Some("boom".to_string());

        let decision =
            apply_retry_transition(&mut step, "boom", BackoffStrategy::Exponential, 1.0);

        assert!(decision.will_retry);
        assert_eq!(decision.backoff_seconds, Some(1.0));
        assert_eq!(decision.max_retries, 2);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 1);
        assert!(step.completed_at.is_none());
        assert!(step.error.is_none());
    }

    #[test]
    fn marks_failed_at_limit() {
        let mut step = make_step();
        step.retry = Some(1);
        step.retry_count = 1;
        step.status = StepStatus::Running;

        let decision =
            apply_retry_transition(&mut step, "boom", BackoffStrategy::Exponential, 1.0);

        assert!(!decision.will_retry);
        assert!(decision.backoff_seconds.is_none());
        assert_eq!(decision.max_retries, 1);
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn zero_retry_budget_fails_immediately() {
        let mut step = make_step();
        step.retry = Some(0);
        step.status = StepStatus::Running;

        let decision =
            apply_retry_transition(&mut step, "boom", BackoffStrategy::Exponential, 1.0);
        assert!(!decision.will_retry);
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn agent_budget_applies_without_override() {
        let mut step = make_step();
        assert!(step.retry.is_none());

        // agent.max_retries is 2: two requeues, then terminal failure
        for expected in 1..=2u32 {
            let decision =
                apply_retry_transition(&mut step, "boom", BackoffStrategy::Exponential, 1.0);
            assert!(decision.will_retry, "attempt {expected} should requeue");
            assert_eq!(step.retry_count, expected);
        }
        let decision =
            apply_retry_transition(&mut step, "boom", BackoffStrategy::Exponential, 1.0);
        assert!(!decision.will_retry);
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn per_step_backoff_strategy_wins() {
        let mut step = make_step();
        step.retry = Some(3);
        step.backoff_strategy = Some(BackoffStrategy::Constant);
        step.initial_delay_secs = 7.0;

        let decision =
            apply_retry_transition(&mut step, "boom", BackoffStrategy::Exponential, 1.0);
        assert_eq!(decision.backoff_seconds, Some(7.0));
    }
}
