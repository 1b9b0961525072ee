//! Issue-centric facade over the workflow engine.
//!
//! External completion signals carry an issue id, the completing agent's
//! stable name, structured outputs and an optional event id. The adapter
//! resolves the issue to its workflow through the mapping store, consults
//! the idempotency ledger, locates the RUNNING step whose agent matches,
//! and delegates to the engine. It also exposes the issue-addressed
//! auxiliary operations (pause, resume, approve, deny, status, create,
//! approval gates) and blocking wrappers for sync callers.
//!
//! The mapping store, pending-approval store and ledger are process-wide
//! collaborators injected through the constructor; tests replace them
//! with the in-memory doubles.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use cadenza_types::error::EngineError;
use cadenza_types::event::{AuditEvent, AuditKind};
use cadenza_types::workflow::{CompletionSignal, PendingApproval, StepStatus, Workflow, WorkflowState};

use crate::store::memory::MemoryCompletionLedger;
use crate::store::{CompletionLedger, WorkflowStore};
use crate::workflow::definition::{self, LoadOptions};
use crate::workflow::engine::{EngineHooks, NoopHooks, WorkflowEngine};

// ---------------------------------------------------------------------------
// Approval notifications
// ---------------------------------------------------------------------------

/// Callback fired when a step requests human approval. Implemented by
/// notification-channel collaborators; failures are logged, never
/// propagated.
pub trait ApprovalNotifier: Send + Sync {
    fn notify_approval_required(
        &self,
        _issue: &str,
        _step_num: u32,
        _step_name: &str,
        _agent: &str,
        _approvers: &[String],
    ) -> impl std::future::Future<Output = Result<(), String>> + Send {
        async { Ok::<(), String>(()) }
    }
}

/// Notifier that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl ApprovalNotifier for NoopNotifier {}

// ---------------------------------------------------------------------------
// IssueWorkflowAdapter
// ---------------------------------------------------------------------------

/// Facade mapping external issue ids onto workflow operations.
pub struct IssueWorkflowAdapter<S, L = MemoryCompletionLedger, N = NoopNotifier, H = NoopHooks> {
    engine: WorkflowEngine<S, H>,
    store: Arc<S>,
    ledger: Option<Arc<L>>,
    notifier: Arc<N>,
}

impl<S: WorkflowStore> IssueWorkflowAdapter<S> {
    /// Adapter with no ledger and no notifier: every signal is processed
    /// and approval requests are persisted without notification.
    pub fn from_engine(engine: WorkflowEngine<S>) -> Self {
        let store = engine.store().clone();
        IssueWorkflowAdapter {
            engine,
            store,
            ledger: None,
            notifier: Arc::new(NoopNotifier),
        }
    }
}

impl<S, L, N, H> IssueWorkflowAdapter<S, L, N, H>
where
    S: WorkflowStore,
    L: CompletionLedger,
    N: ApprovalNotifier,
    H: EngineHooks,
{
    pub fn new(engine: WorkflowEngine<S, H>, ledger: Option<Arc<L>>, notifier: Arc<N>) -> Self {
        let store = engine.store().clone();
        IssueWorkflowAdapter {
            engine,
            store,
            ledger,
            notifier,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine<S, H> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Completion signals
    // -----------------------------------------------------------------------

    /// Apply an external completion signal (see `complete_step_for_issue`).
    pub async fn complete_signal(
        &self,
        signal: &CompletionSignal,
    ) -> Result<Option<Workflow>, EngineError> {
        self.complete_step_for_issue(
            &signal.issue,
            &signal.agent_type,
            signal.outputs.clone(),
            signal.event_id.as_deref(),
        )
        .await
    }

    /// Mark the current RUNNING step for an issue as complete and advance
    /// the workflow.
    ///
    /// Resolution order: issue mapping (unmapped issues are silently
    /// ignored), workflow load, idempotency ledger (duplicate composite
    /// keys are suppressed without side effects), PENDING auto-start,
    /// then the RUNNING step whose agent name equals
    /// `completing_agent_type`. A signal whose agent matches no RUNNING
    /// step while another step is active is a completion mismatch and
    /// does not advance the workflow.
    pub async fn complete_step_for_issue(
        &self,
        issue: &str,
        completing_agent_type: &str,
        outputs: HashMap<String, Value>,
        event_id: Option<&str>,
    ) -> Result<Option<Workflow>, EngineError> {
        let Some(workflow_id) = self.store.get_workflow_id_for_issue(issue).await? else {
            tracing::debug!(issue, "no workflow mapping for issue, ignoring completion");
            return Ok(None);
        };
        let Some(mut workflow) = self.engine.get_workflow(&workflow_id).await? else {
            tracing::debug!(issue, workflow_id = workflow_id.as_str(), "mapped workflow not found");
            return Ok(None);
        };

        if let (Some(event_id), Some(ledger)) = (event_id, self.ledger.as_ref()) {
            let key = format!("{issue}:{completing_agent_type}:{event_id}");
            if !ledger.check_and_insert(&key).await? {
                tracing::info!(issue, key = key.as_str(), "duplicate completion signal suppressed");
                return Ok(Some(workflow));
            }
        }

        if workflow.state == WorkflowState::Pending {
            match self.engine.start_workflow(&workflow_id).await {
                Ok(started) => workflow = started,
                Err(err) => {
                    tracing::warn!(
                        issue,
                        workflow_id = workflow_id.as_str(),
                        error = %err,
                        "failed to auto-start pending workflow"
                    );
                    return Ok(Some(workflow));
                }
            }
        }

        let matching = workflow
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Running && s.agent.name == completing_agent_type);

        let Some(step) = matching else {
            let any_running = workflow.steps.iter().any(|s| s.status == StepStatus::Running);
            if any_running {
                let active_agent = workflow.active_agent_type().map(str::to_string);
                tracing::error!(
                    issue,
                    completed_agent = completing_agent_type,
                    active_agent = active_agent.as_deref().unwrap_or("none"),
                    "completion agent mismatch"
                );
                return Err(EngineError::CompletionMismatch {
                    issue: issue.to_string(),
                    completed_agent: completing_agent_type.to_string(),
                    active_agent,
                });
            }
            tracing::warn!(
                issue,
                workflow_id = workflow_id.as_str(),
                "no RUNNING step, returning workflow unchanged"
            );
            return Ok(Some(workflow));
        };

        let step_num = step.step_num;
        let updated = self
            .engine
            .complete_step(&workflow_id, step_num, outputs, None)
            .await?;
        Ok(Some(updated))
    }

    // -----------------------------------------------------------------------
    // Issue-addressed lifecycle
    // -----------------------------------------------------------------------

    /// Pause the workflow mapped to an issue.
    pub async fn pause_workflow(&self, issue: &str) -> Result<Option<Workflow>, EngineError> {
        let Some(workflow_id) = self.store.get_workflow_id_for_issue(issue).await? else {
            tracing::warn!(issue, "no workflow mapping found");
            return Ok(None);
        };
        Ok(Some(self.engine.pause_workflow(&workflow_id).await?))
    }

    /// Resume the workflow mapped to an issue.
    pub async fn resume_workflow(&self, issue: &str) -> Result<Option<Workflow>, EngineError> {
        let Some(workflow_id) = self.store.get_workflow_id_for_issue(issue).await? else {
            tracing::warn!(issue, "no workflow mapping found");
            return Ok(None);
        };
        Ok(Some(self.engine.resume_workflow(&workflow_id).await?))
    }

    /// Approve the pending step for an issue and clear its approval
    /// record.
    pub async fn approve_step(
        &self,
        issue: &str,
        approved_by: &str,
    ) -> Result<Option<Workflow>, EngineError> {
        let Some(workflow_id) = self.store.get_workflow_id_for_issue(issue).await? else {
            tracing::warn!(issue, "no workflow mapping found");
            return Ok(None);
        };
        let workflow = self.engine.approve_step(&workflow_id, approved_by).await?;
        self.store.clear_pending_workflow_approval(issue).await?;
        Ok(Some(workflow))
    }

    /// Deny the pending step for an issue and clear its approval record.
    pub async fn deny_step(
        &self,
        issue: &str,
        denied_by: &str,
        reason: &str,
    ) -> Result<Option<Workflow>, EngineError> {
        let Some(workflow_id) = self.store.get_workflow_id_for_issue(issue).await? else {
            tracing::warn!(issue, "no workflow mapping found");
            return Ok(None);
        };
        let workflow = self.engine.deny_step(&workflow_id, denied_by, reason).await?;
        self.store.clear_pending_workflow_approval(issue).await?;
        Ok(Some(workflow))
    }

    /// Status payload for the workflow mapped to an issue.
    pub async fn get_workflow_status(&self, issue: &str) -> Result<Option<Value>, EngineError> {
        let Some(workflow_id) = self.store.get_workflow_id_for_issue(issue).await? else {
            return Ok(None);
        };
        let Some(workflow) = self.engine.get_workflow(&workflow_id).await? else {
            return Ok(None);
        };

        let current = workflow
            .step(workflow.current_step)
            .or_else(|| workflow.steps.first());
        Ok(Some(json!({
            "workflow_id": workflow.id,
            "name": workflow.name,
            "state": workflow.state.as_str(),
            "current_step": workflow.current_step,
            "total_steps": workflow.steps.len(),
            "current_step_name": current.map(|s| s.name.clone()),
            "current_agent": current.map(|s| s.agent.display_name.clone()),
            "created_at": workflow.created_at.to_rfc3339(),
            "updated_at": workflow.updated_at.to_rfc3339(),
            "metadata": workflow.metadata,
        })))
    }

    // -----------------------------------------------------------------------
    // Creation and approval gates
    // -----------------------------------------------------------------------

    /// Build a workflow from a definition file for an issue, persist it,
    /// and map the issue to it. Returns the new workflow id.
    pub async fn create_workflow_for_issue(
        &self,
        issue: &str,
        issue_title: &str,
        project: &str,
        tier: &str,
        definition_path: &Path,
        description: Option<&str>,
    ) -> Result<String, EngineError> {
        let workflow_id = format!("{project}-{issue}-{tier}");
        let mut options = LoadOptions::tier(tier);
        options.workflow_id = Some(workflow_id.clone());
        options.name_override = Some(format!("{project}/{issue_title}"));
        options.description_override = Some(
            description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Workflow for issue #{issue}")),
        );
        options.metadata = [
            ("issue_number".to_string(), json!(issue)),
            ("project".to_string(), json!(project)),
            ("tier".to_string(), json!(tier)),
        ]
        .into_iter()
        .collect();

        let workflow = definition::load_file(definition_path, &options)
            .map_err(|e| EngineError::Definition(e.to_string()))?;

        self.engine.create_workflow(workflow).await?;
        self.store.map_issue_to_workflow(issue, &workflow_id).await?;

        tracing::info!(issue, workflow_id = workflow_id.as_str(), "created workflow for issue");
        Ok(workflow_id)
    }

    /// Start a workflow by its workflow id.
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.engine.start_workflow(workflow_id).await
    }

    /// Persist a pending approval gate for an issue, audit it, and fire
    /// the approval-required notification.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_approval_gate(
        &self,
        workflow_id: &str,
        issue: &str,
        step_num: u32,
        step_name: &str,
        agent_name: &str,
        approvers: &[String],
        timeout_secs: u64,
    ) -> Result<(), EngineError> {
        let approval = PendingApproval {
            step_num,
            step_name: step_name.to_string(),
            approvers: approvers.to_vec(),
            timeout_secs,
            requested_at: Utc::now(),
        };
        self.store.set_pending_workflow_approval(issue, &approval).await?;

        let event = AuditEvent::new(
            workflow_id,
            AuditKind::ApprovalRequested,
            json!({
                "issue": issue,
                "step_num": step_num,
                "step_name": step_name,
                "approvers": approvers,
                "timeout_secs": timeout_secs,
            }),
        );
        self.store.append_audit_event(&event).await?;

        if let Err(err) = self
            .notifier
            .notify_approval_required(issue, step_num, step_name, agent_name, approvers)
            .await
        {
            tracing::warn!(issue, error = err.as_str(), "approval notification failed");
        }

        tracing::info!(
            workflow_id,
            issue,
            step_num,
            step_name,
            "approval gate requested"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blocking wrappers
    // -----------------------------------------------------------------------

    /// Blocking form of `complete_step_for_issue` for sync callers.
    ///
    /// Must not be called from a current-thread async runtime.
    pub fn complete_step_for_issue_blocking(
        &self,
        issue: &str,
        completing_agent_type: &str,
        outputs: HashMap<String, Value>,
        event_id: Option<&str>,
    ) -> Result<Option<Workflow>, EngineError> {
        block_on(self.complete_step_for_issue(issue, completing_agent_type, outputs, event_id))?
    }

    /// Blocking form of `pause_workflow`.
    pub fn pause_workflow_blocking(&self, issue: &str) -> Result<Option<Workflow>, EngineError> {
        block_on(self.pause_workflow(issue))?
    }

    /// Blocking form of `resume_workflow`.
    pub fn resume_workflow_blocking(&self, issue: &str) -> Result<Option<Workflow>, EngineError> {
        block_on(self.resume_workflow(issue))?
    }

    /// Blocking form of `get_workflow_status`.
    pub fn get_workflow_status_blocking(&self, issue: &str) -> Result<Option<Value>, EngineError> {
        block_on(self.get_workflow_status(issue))?
    }
}

/// Drive a future to completion from sync code: reuse the ambient
/// multi-thread runtime when one exists, else spin up a small
/// current-thread runtime for the call.
fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, EngineError> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(future))),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| EngineError::Runtime(format!("blocking runtime: {e}")))?;
            Ok(runtime.block_on(future))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::bus::EventBus;
    use crate::store::memory::{MemoryCompletionLedger, MemoryWorkflowStore};
    use cadenza_types::workflow::{Agent, Route, WorkflowStep};

    fn agent(name: &str) -> Agent {
        Agent {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            provider_preference: None,
            timeout_secs: 60,
            max_retries: 0,
        }
    }

    fn step(num: u32, id: &str, agent_type: &str) -> WorkflowStep {
        WorkflowStep::new(num, id, agent(agent_type), "do work")
    }

    fn running_workflow(id: &str, steps: Vec<WorkflowStep>) -> Workflow {
        let mut wf = Workflow::new(id, "test", "1.0");
        wf.require_human_merge_approval = false;
        wf.steps = steps;
        wf.state = WorkflowState::Running;
        wf.current_step = 1;
        wf.steps[0].status = StepStatus::Running;
        wf.steps[0].started_at = Some(Utc::now());
        wf
    }

    async fn adapter_with(
        workflow: Workflow,
        issue: &str,
    ) -> (
        IssueWorkflowAdapter<MemoryWorkflowStore>,
        Arc<MemoryWorkflowStore>,
    ) {
        let store = Arc::new(MemoryWorkflowStore::new());
        store.save_workflow(&workflow).await.unwrap();
        store.map_issue_to_workflow(issue, &workflow.id).await.unwrap();
        let engine = WorkflowEngine::new(store.clone(), EventBus::new(64));
        (IssueWorkflowAdapter::from_engine(engine), store)
    }

    fn ledgered(
        store: Arc<MemoryWorkflowStore>,
    ) -> IssueWorkflowAdapter<MemoryWorkflowStore, MemoryCompletionLedger> {
        let engine = WorkflowEngine::new(store, EventBus::new(64));
        IssueWorkflowAdapter::new(
            engine,
            Some(Arc::new(MemoryCompletionLedger::new(100))),
            Arc::new(NoopNotifier),
        )
    }

    fn outputs(value: Value) -> HashMap<String, Value> {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }

    // -------------------------------------------------------------------
    // Basic advancement
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn completion_advances_to_next_step() {
        let wf = running_workflow(
            "wf-42",
            vec![step(1, "develop", "developer"), step(2, "review", "reviewer")],
        );
        let (adapter, _) = adapter_with(wf, "42").await;

        let updated = adapter
            .complete_step_for_issue("42", "developer", outputs(json!({"pr": "1"})), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.active_agent_type(), Some("reviewer"));
        assert_eq!(updated.state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn completing_last_step_completes_workflow() {
        let wf = running_workflow("wf-99", vec![step(1, "close_loop", "summarizer")]);
        let (adapter, _) = adapter_with(wf, "99").await;

        let updated = adapter
            .complete_step_for_issue("99", "summarizer", outputs(json!({"summary": "done"})), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.state, WorkflowState::Completed);
        assert_eq!(updated.active_agent_type(), None);
    }

    #[tokio::test]
    async fn unmapped_issue_is_silently_ignored() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let engine = WorkflowEngine::new(store, EventBus::new(64));
        let adapter = IssueWorkflowAdapter::from_engine(engine);

        let result = adapter
            .complete_step_for_issue("999", "developer", HashMap::new(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn mapped_but_missing_workflow_is_ignored() {
        let store = Arc::new(MemoryWorkflowStore::new());
        store.map_issue_to_workflow("7", "ghost").await.unwrap();
        let engine = WorkflowEngine::new(store, EventBus::new(64));
        let adapter = IssueWorkflowAdapter::from_engine(engine);

        assert!(
            adapter
                .complete_step_for_issue("7", "developer", HashMap::new(), None)
                .await
                .unwrap()
                .is_none()
        );
    }

    // -------------------------------------------------------------------
    // Agent matching
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn mismatched_agent_raises_and_leaves_workflow_untouched() {
        let wf = running_workflow(
            "wf-x",
            vec![step(1, "develop", "developer"), step(2, "review", "reviewer")],
        );
        let (adapter, store) = adapter_with(wf, "x").await;
        let audit_before = store.get_audit_log("wf-x", None).await.unwrap().len();

        let err = adapter
            .complete_step_for_issue("x", "reviewer", HashMap::new(), None)
            .await
            .unwrap_err();

        match err {
            EngineError::CompletionMismatch {
                issue,
                completed_agent,
                active_agent,
            } => {
                assert_eq!(issue, "x");
                assert_eq!(completed_agent, "reviewer");
                assert_eq!(active_agent.as_deref(), Some("developer"));
            }
            other => panic!("expected CompletionMismatch, got {other}"),
        }

        let reloaded = store.load_workflow("wf-x").await.unwrap().unwrap();
        assert_eq!(reloaded.steps[0].status, StepStatus::Running);
        assert_eq!(reloaded.steps[1].status, StepStatus::Pending);
        let audit_after = store.get_audit_log("wf-x", None).await.unwrap().len();
        assert_eq!(audit_before, audit_after, "no audit events appended");
    }

    #[tokio::test]
    async fn no_running_step_returns_workflow_unchanged() {
        let mut wf = running_workflow("wf-idle", vec![step(1, "develop", "developer")]);
        wf.steps[0].status = StepStatus::Completed;
        let (adapter, _) = adapter_with(wf, "idle").await;

        let result = adapter
            .complete_step_for_issue("idle", "developer", HashMap::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Completed);
    }

    // -------------------------------------------------------------------
    // Auto-start
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn pending_workflow_auto_starts_before_completion() {
        let mut wf = Workflow::new("wf-pending", "test", "1.0");
        wf.require_human_merge_approval = false;
        wf.steps = vec![step(1, "triage", "triage"), step(2, "debug", "debug")];
        let (adapter, _) = adapter_with(wf, "pending").await;

        let updated = adapter
            .complete_step_for_issue("pending", "triage", outputs(json!({"priority": "p2"})), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.state, WorkflowState::Running);
        assert_eq!(updated.active_agent_type(), Some("debug"));
    }

    // -------------------------------------------------------------------
    // Router loop (review/develop)
    // -------------------------------------------------------------------

    fn review_loop_workflow(id: &str) -> Workflow {
        let mut router = step(3, "route_review", "router");
        router.routes = vec![
            Route {
                when: Some("approval_status == 'approved'".to_string()),
                then: Some("close_loop".to_string()),
                ..Route::default()
            },
            Route {
                default: Some(json!("develop")),
                ..Route::default()
            },
        ];
        running_workflow(
            id,
            vec![
                step(1, "develop", "developer"),
                step(2, "review", "reviewer"),
                router,
                step(4, "close_loop", "summarizer"),
            ],
        )
    }

    #[tokio::test]
    async fn router_approves_through_to_close() {
        let (adapter, _) = adapter_with(review_loop_workflow("wf-router"), "router").await;

        adapter
            .complete_step_for_issue("router", "developer", outputs(json!({"pr": "1"})), None)
            .await
            .unwrap();
        let updated = adapter
            .complete_step_for_issue(
                "router",
                "reviewer",
                outputs(json!({"approval_status": "approved", "review_comments": []})),
                None,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.active_agent_type(), Some("summarizer"));
    }

    #[tokio::test]
    async fn router_loops_back_to_develop_on_changes_requested() {
        let (adapter, store) = adapter_with(review_loop_workflow("wf-loop"), "loop").await;

        adapter
            .complete_step_for_issue("loop", "developer", outputs(json!({"pr": "1"})), None)
            .await
            .unwrap();
        let updated = adapter
            .complete_step_for_issue(
                "loop",
                "reviewer",
                outputs(json!({"approval_status": "changes_requested"})),
                None,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.active_agent_type(), Some("developer"));
        assert_eq!(updated.steps[0].iteration, 1);
        assert_eq!(updated.steps[1].status, StepStatus::Completed);
        assert_eq!(updated.steps[2].status, StepStatus::Skipped);

        // second pass: approve and land on close_loop
        adapter
            .complete_step_for_issue("loop", "developer", outputs(json!({"pr": "1"})), None)
            .await
            .unwrap();
        let updated = adapter
            .complete_step_for_issue(
                "loop",
                "reviewer",
                outputs(json!({"approval_status": "approved"})),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.active_agent_type(), Some("summarizer"));

        let log = store.get_audit_log("wf-loop", None).await.unwrap();
        assert!(log.iter().any(|e| e.event_type == "STEP_SKIPPED"
            && e.data["reason"] == json!("router evaluated")));
    }

    // -------------------------------------------------------------------
    // Idempotency ledger
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn duplicate_event_id_is_suppressed() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let wf = running_workflow("wf-idem", vec![step(1, "triage", "triage"), step(2, "dev", "developer")]);
        store.save_workflow(&wf).await.unwrap();
        store.map_issue_to_workflow("idem", "wf-idem").await.unwrap();
        let adapter = ledgered(store.clone());

        let updated = adapter
            .complete_step_for_issue("idem", "triage", HashMap::new(), Some("ev-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.active_agent_type(), Some("developer"));

        // Simulate re-delivery: reset step 1 back to RUNNING.
        let mut replayed = store.load_workflow("wf-idem").await.unwrap().unwrap();
        replayed.steps[0].status = StepStatus::Running;
        replayed.steps[1].status = StepStatus::Pending;
        replayed.current_step = 1;
        store.save_workflow(&replayed).await.unwrap();
        let completed_audits_before = store
            .get_audit_log("wf-idem", None)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "STEP_COMPLETED")
            .count();

        // Replaying the same composite key must be a no-op.
        adapter
            .complete_step_for_issue("idem", "triage", HashMap::new(), Some("ev-001"))
            .await
            .unwrap();

        let reloaded = store.load_workflow("wf-idem").await.unwrap().unwrap();
        assert_eq!(reloaded.steps[0].status, StepStatus::Running);
        let completed_audits_after = store
            .get_audit_log("wf-idem", None)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "STEP_COMPLETED")
            .count();
        assert_eq!(completed_audits_before, completed_audits_after);
    }

    #[tokio::test]
    async fn distinct_event_ids_advance_independently() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let wf = running_workflow("wf-idem2", vec![step(1, "triage", "triage"), step(2, "dev", "developer")]);
        store.save_workflow(&wf).await.unwrap();
        store.map_issue_to_workflow("idem2", "wf-idem2").await.unwrap();
        let adapter = ledgered(store);

        adapter
            .complete_step_for_issue("idem2", "triage", HashMap::new(), Some("ev-aaa"))
            .await
            .unwrap();
        let updated = adapter
            .complete_step_for_issue("idem2", "developer", HashMap::new(), Some("ev-bbb"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn missing_event_id_skips_the_ledger() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let wf = running_workflow("wf-idem3", vec![step(1, "triage", "triage"), step(2, "dev", "developer")]);
        store.save_workflow(&wf).await.unwrap();
        store.map_issue_to_workflow("idem3", "wf-idem3").await.unwrap();
        let adapter = ledgered(store);

        adapter
            .complete_step_for_issue("idem3", "triage", HashMap::new(), None)
            .await
            .unwrap();
        let updated = adapter
            .complete_step_for_issue("idem3", "developer", HashMap::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn completion_signal_struct_drives_the_same_path() {
        let wf = running_workflow("wf-sig", vec![step(1, "triage", "triage")]);
        let (adapter, _) = adapter_with(wf, "sig").await;

        let signal = CompletionSignal {
            issue: "sig".to_string(),
            agent_type: "triage".to_string(),
            outputs: HashMap::new(),
            event_id: None,
        };
        let updated = adapter.complete_signal(&signal).await.unwrap().unwrap();
        assert_eq!(updated.state, WorkflowState::Completed);
    }

    // -------------------------------------------------------------------
    // Auxiliary operations
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn pause_resume_and_status_by_issue() {
        let wf = running_workflow("wf-aux", vec![step(1, "develop", "developer")]);
        let (adapter, _) = adapter_with(wf, "aux").await;

        let paused = adapter.pause_workflow("aux").await.unwrap().unwrap();
        assert_eq!(paused.state, WorkflowState::Paused);
        let resumed = adapter.resume_workflow("aux").await.unwrap().unwrap();
        assert_eq!(resumed.state, WorkflowState::Running);

        let status = adapter.get_workflow_status("aux").await.unwrap().unwrap();
        assert_eq!(status["workflow_id"], json!("wf-aux"));
        assert_eq!(status["state"], json!("running"));
        assert_eq!(status["current_step_name"], json!("develop"));
        assert_eq!(status["total_steps"], json!(1));

        assert!(adapter.pause_workflow("unmapped").await.unwrap().is_none());
        assert!(adapter.get_workflow_status("unmapped").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paused_workflow_still_accepts_completions() {
        let wf = running_workflow(
            "wf-paused",
            vec![step(1, "develop", "developer"), step(2, "review", "reviewer")],
        );
        let (adapter, _) = adapter_with(wf, "paused").await;
        adapter.pause_workflow("paused").await.unwrap();

        let updated = adapter
            .complete_step_for_issue("paused", "developer", HashMap::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.steps[1].status, StepStatus::Running);
    }

    #[tokio::test]
    async fn approve_and_deny_clear_pending_approval() {
        let wf = running_workflow("wf-appr", vec![step(1, "deploy", "deployer")]);
        let (adapter, store) = adapter_with(wf, "appr").await;

        adapter
            .request_approval_gate(
                "wf-appr",
                "appr",
                1,
                "deploy",
                "deployer",
                &["alice".to_string()],
                3600,
            )
            .await
            .unwrap();
        assert!(
            store
                .get_pending_workflow_approval("appr")
                .await
                .unwrap()
                .is_some()
        );
        let log = store.get_audit_log("wf-appr", None).await.unwrap();
        assert!(log.iter().any(|e| e.event_type == "APPROVAL_REQUESTED"));

        adapter.approve_step("appr", "alice").await.unwrap();
        assert!(
            store
                .get_pending_workflow_approval("appr")
                .await
                .unwrap()
                .is_none()
        );

        adapter
            .request_approval_gate(
                "wf-appr",
                "appr",
                1,
                "deploy",
                "deployer",
                &["alice".to_string()],
                3600,
            )
            .await
            .unwrap();
        adapter.deny_step("appr", "alice", "not yet").await.unwrap();
        assert!(
            store
                .get_pending_workflow_approval("appr")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn create_workflow_for_issue_maps_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delivery.yaml");
        std::fs::write(
            &path,
            r#"
name: delivery
steps:
  - id: triage
    agent_type: triage
  - id: develop
    agent_type: developer
full_workflow:
  steps:
    - id: triage
      agent_type: triage
"#,
        )
        .unwrap();

        let store = Arc::new(MemoryWorkflowStore::new());
        let engine = WorkflowEngine::new(store.clone(), EventBus::new(64));
        let adapter = IssueWorkflowAdapter::from_engine(engine);

        let workflow_id = adapter
            .create_workflow_for_issue("42", "fix crash", "proj", "full", &path, None)
            .await
            .unwrap();
        assert_eq!(workflow_id, "proj-42-full");

        let mapped = store.get_workflow_id_for_issue("42").await.unwrap();
        assert_eq!(mapped.as_deref(), Some("proj-42-full"));

        let wf = store.load_workflow("proj-42-full").await.unwrap().unwrap();
        assert_eq!(wf.state, WorkflowState::Pending);
        assert_eq!(wf.name, "proj/fix crash");
        assert_eq!(wf.steps.len(), 1, "tier variant selected");
        assert_eq!(wf.metadata["issue_number"], json!("42"));

        // end to end: auto-start on the first completion signal
        let updated = adapter
            .complete_step_for_issue("42", "triage", HashMap::new(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, WorkflowState::Completed);
    }

    // -------------------------------------------------------------------
    // Blocking wrappers
    // -------------------------------------------------------------------

    #[test]
    fn blocking_wrappers_work_without_a_runtime() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let wf = running_workflow(
            "wf-blocking",
            vec![step(1, "develop", "developer"), step(2, "review", "reviewer")],
        );
        let engine = WorkflowEngine::new(store.clone(), EventBus::new(64));
        let adapter = IssueWorkflowAdapter::from_engine(engine);

        block_on(async {
            store.save_workflow(&wf).await.unwrap();
            store.map_issue_to_workflow("blocking", "wf-blocking").await.unwrap();
        })
        .unwrap();

        let updated = adapter
            .complete_step_for_issue_blocking("blocking", "developer", HashMap::new(), None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.active_agent_type(), Some("reviewer"));

        let status = adapter.get_workflow_status_blocking("blocking").unwrap().unwrap();
        assert_eq!(status["state"], json!("running"));
    }
}
