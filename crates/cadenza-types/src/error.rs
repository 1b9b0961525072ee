use thiserror::Error;

use crate::workflow::WorkflowState;

/// Errors from storage-port operations (used by trait definitions in
/// cadenza-core).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised by the workflow engine and the issue adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("step {step_num} not found in workflow '{workflow_id}'")]
    StepNotFound { workflow_id: String, step_num: u32 },

    #[error("cannot {operation} workflow '{workflow_id}' in state {state:?}")]
    InvalidTransition {
        workflow_id: String,
        state: WorkflowState,
        operation: &'static str,
    },

    #[error(
        "completion agent mismatch for issue #{issue}: \
         completed_agent={completed_agent}, active_agent={active_agent:?}"
    )]
    CompletionMismatch {
        issue: String,
        completed_agent: String,
        active_agent: Option<String>,
    },

    #[error(
        "step '{step}' has been re-activated {iteration} times (limit {limit}); \
         aborting to prevent an infinite loop"
    )]
    LoopLimitExceeded {
        step: String,
        iteration: u32,
        limit: u32,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("definition error: {0}")]
    Definition(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = StorageError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn completion_mismatch_carries_both_agents() {
        let err = EngineError::CompletionMismatch {
            issue: "42".to_string(),
            completed_agent: "reviewer".to_string(),
            active_agent: Some("developer".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("#42"));
        assert!(text.contains("reviewer"));
        assert!(text.contains("developer"));
    }

    #[test]
    fn invalid_transition_names_state_and_operation() {
        let err = EngineError::InvalidTransition {
            workflow_id: "wf-1".to_string(),
            state: WorkflowState::Completed,
            operation: "start",
        };
        let text = err.to_string();
        assert!(text.contains("start"));
        assert!(text.contains("wf-1"));
        assert!(text.contains("Completed"));
    }

    #[test]
    fn loop_limit_names_step_and_counts() {
        let err = EngineError::LoopLimitExceeded {
            step: "develop".to_string(),
            iteration: 10,
            limit: 10,
        };
        let text = err.to_string();
        assert!(text.contains("develop"));
        assert!(text.contains("10"));
    }
}
