//! Core workflow orchestration engine.
//!
//! Owns workflow lifecycle operations (create, start, pause, resume,
//! approve, deny, reconcile) and the completion service that advances the
//! state machine when a step reports its outcome. Every state change is
//! persisted through the storage port and recorded on the audit ledger
//! before the call returns; lifecycle events are published on the event
//! bus, and registered hooks are fired with their failures caught and
//! logged.
//!
//! Generic over `S: WorkflowStore` for storage flexibility and
//! `H: EngineHooks` for launcher/notifier wiring.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use cadenza_types::error::EngineError;
use cadenza_types::event::{AuditEvent, AuditKind, WorkflowEvent};
use cadenza_types::workflow::{
    StaleStepAction, StepStatus, Workflow, WorkflowState, WorkflowStep,
};

use crate::event::bus::EventBus;
use crate::store::WorkflowStore;

use super::completion::{StepOutcome, apply_step_outcome};
use super::transition::{self, DEFAULT_MAX_LOOP_ITERATIONS};

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Callbacks fired as the engine advances a workflow.
///
/// The external launcher typically reacts to `on_step_transition` by
/// starting the next agent. Hook failures are logged and never fail the
/// transition.
pub trait EngineHooks: Send + Sync {
    /// A new step was activated after a successful completion.
    fn on_step_transition(
        &self,
        _workflow: &Workflow,
        _step: &WorkflowStep,
        _outputs: &HashMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send {
        async { Ok::<(), String>(()) }
    }

    /// The workflow reached COMPLETED.
    fn on_workflow_complete(
        &self,
        _workflow: &Workflow,
        _outputs: &HashMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send {
        async { Ok::<(), String>(()) }
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The state machine driver. The store is the authoritative source of
/// truth; workflows are never cached beyond a single operation.
pub struct WorkflowEngine<S, H = NoopHooks> {
    store: Arc<S>,
    bus: EventBus,
    hooks: Arc<H>,
    loop_limit: u32,
}

impl<S: WorkflowStore> WorkflowEngine<S, NoopHooks> {
    pub fn new(store: Arc<S>, bus: EventBus) -> Self {
        Self::with_hooks(store, bus, Arc::new(NoopHooks))
    }
}

impl<S: WorkflowStore, H: EngineHooks> WorkflowEngine<S, H> {
    pub fn with_hooks(store: Arc<S>, bus: EventBus, hooks: Arc<H>) -> Self {
        WorkflowEngine {
            store,
            bus,
            hooks,
            loop_limit: DEFAULT_MAX_LOOP_ITERATIONS,
        }
    }

    /// Override the goto re-entry safety limit.
    pub fn with_loop_limit(mut self, limit: u32) -> Self {
        self.loop_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create and persist a new workflow in PENDING state.
    pub async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow, EngineError> {
        workflow.state = WorkflowState::Pending;
        let now = Utc::now();
        workflow.created_at = now;
        workflow.updated_at = now;

        self.store.save_workflow(&workflow).await?;
        self.audit(
            &workflow.id,
            AuditKind::WorkflowCreated,
            json!({ "name": workflow.name }),
        )
        .await?;

        tracing::info!(workflow_id = workflow.id.as_str(), name = workflow.name.as_str(), "created workflow");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, EngineError> {
        Ok(self.store.load_workflow(workflow_id).await?)
    }

    /// Start a PENDING workflow: transition to RUNNING and activate step 1.
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state != WorkflowState::Pending {
            return Err(EngineError::InvalidTransition {
                workflow_id: workflow_id.to_string(),
                state: workflow.state,
                operation: "start",
            });
        }

        workflow.state = WorkflowState::Running;
        workflow.updated_at = Utc::now();

        let activated = if workflow.steps.is_empty() {
            Vec::new()
        } else {
            transition::activate_step(&mut workflow, 0)
        };

        self.store.save_workflow(&workflow).await?;
        self.audit(workflow_id, AuditKind::WorkflowStarted, json!({})).await?;
        self.announce_started(&workflow, &activated).await?;

        tracing::info!(workflow_id, "started workflow");
        Ok(workflow)
    }

    /// Pause a RUNNING workflow. The active step keeps its status.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state != WorkflowState::Running {
            return Err(EngineError::InvalidTransition {
                workflow_id: workflow_id.to_string(),
                state: workflow.state,
                operation: "pause",
            });
        }

        workflow.state = WorkflowState::Paused;
        workflow.updated_at = Utc::now();
        self.store.save_workflow(&workflow).await?;
        self.audit(workflow_id, AuditKind::WorkflowPaused, json!({})).await?;

        tracing::info!(workflow_id, "paused workflow");
        Ok(workflow)
    }

    /// Resume a PAUSED workflow.
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state != WorkflowState::Paused {
            return Err(EngineError::InvalidTransition {
                workflow_id: workflow_id.to_string(),
                state: workflow.state,
                operation: "resume",
            });
        }

        workflow.state = WorkflowState::Running;
        workflow.updated_at = Utc::now();
        self.store.save_workflow(&workflow).await?;
        self.audit(workflow_id, AuditKind::WorkflowResumed, json!({})).await?;

        tracing::info!(workflow_id, "resumed workflow");
        Ok(workflow)
    }

    /// Record an approval grant. A paused workflow resumes.
    pub async fn approve_step(
        &self,
        workflow_id: &str,
        approved_by: &str,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state == WorkflowState::Paused {
            workflow.state = WorkflowState::Running;
            workflow.updated_at = Utc::now();
            self.store.save_workflow(&workflow).await?;
        }

        let event = AuditEvent::new(
            workflow_id,
            AuditKind::ApprovalGranted,
            json!({ "step_num": workflow.current_step, "approved_by": approved_by }),
        )
        .with_user(approved_by);
        self.store.append_audit_event(&event).await?;

        tracing::info!(workflow_id, approved_by, "approval granted");
        Ok(workflow)
    }

    /// Record an approval denial. A running workflow pauses.
    pub async fn deny_step(
        &self,
        workflow_id: &str,
        denied_by: &str,
        reason: &str,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state == WorkflowState::Running {
            workflow.state = WorkflowState::Paused;
            workflow.updated_at = Utc::now();
            self.store.save_workflow(&workflow).await?;
        }

        let event = AuditEvent::new(
            workflow_id,
            AuditKind::ApprovalDenied,
            json!({ "step_num": workflow.current_step, "denied_by": denied_by, "reason": reason }),
        )
        .with_user(denied_by);
        self.store.append_audit_event(&event).await?;

        tracing::info!(workflow_id, denied_by, reason, "approval denied");
        Ok(workflow)
    }

    pub async fn get_audit_log(
        &self,
        workflow_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, EngineError> {
        Ok(self.store.get_audit_log(workflow_id, since).await?)
    }

    // -----------------------------------------------------------------------
    // Completion service
    // -----------------------------------------------------------------------

    /// Apply a step's reported outcome and advance the workflow.
    ///
    /// On error with retry budget the step is requeued (STEP_RETRY audit,
    /// no StepCompleted event). On terminal failure the step stays FAILED
    /// and forward progress halts with the workflow still RUNNING. On
    /// success the transition service resolves and activates the
    /// successor; reaching the end (or a `final_step`) completes the
    /// workflow.
    pub async fn complete_step(
        &self,
        workflow_id: &str,
        step_num: u32,
        outputs: HashMap<String, Value>,
        error: Option<String>,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        let Some(step_idx) = workflow.steps.iter().position(|s| s.step_num == step_num) else {
            return Err(EngineError::StepNotFound {
                workflow_id: workflow_id.to_string(),
                step_num,
            });
        };

        let default_backoff = workflow.orchestration.backoff;
        let default_base = workflow.orchestration.initial_delay_seconds;
        let step_name = workflow.steps[step_idx].name.clone();

        let outcome = apply_step_outcome(
            &mut workflow.steps[step_idx],
            outputs.clone(),
            error.as_deref(),
            default_backoff,
            default_base,
        );

        match outcome {
            StepOutcome::Requeued(decision) => {
                workflow.updated_at = Utc::now();
                self.store.save_workflow(&workflow).await?;
                self.audit(
                    workflow_id,
                    AuditKind::StepRetry,
                    json!({
                        "step_num": step_num,
                        "step_name": step_name,
                        "retry_count": workflow.steps[step_idx].retry_count,
                        "max_retries": decision.max_retries,
                        "backoff_seconds": decision.backoff_seconds,
                        "error": error,
                    }),
                )
                .await?;
                self.bus.publish(WorkflowEvent::StepFailed {
                    workflow_id: workflow_id.to_string(),
                    step_num,
                    step_name,
                    error: error.unwrap_or_default(),
                    will_retry: true,
                });
                return Ok(workflow);
            }
            StepOutcome::Failed => {
                workflow.updated_at = Utc::now();
                self.store.save_workflow(&workflow).await?;
                self.audit(
                    workflow_id,
                    AuditKind::StepFailed,
                    json!({ "step_num": step_num, "step_name": step_name, "error": error }),
                )
                .await?;
                self.bus.publish(WorkflowEvent::StepFailed {
                    workflow_id: workflow_id.to_string(),
                    step_num,
                    step_name,
                    error: error.unwrap_or_default(),
                    will_retry: false,
                });
                // Forward progress halts; the workflow stays RUNNING until
                // an operator reconciles it.
                return Ok(workflow);
            }
            StepOutcome::Completed => {}
        }

        self.bus.publish(WorkflowEvent::StepCompleted {
            workflow_id: workflow_id.to_string(),
            step_num,
            step_name: step_name.clone(),
        });

        // A final step short-circuits the transition service.
        if workflow.steps[step_idx].final_step {
            workflow.state = WorkflowState::Completed;
            workflow.completed_at = Some(Utc::now());
            workflow.updated_at = Utc::now();
            self.store.save_workflow(&workflow).await?;
            self.audit(
                workflow_id,
                AuditKind::StepCompleted,
                json!({ "step_num": step_num, "step_name": step_name, "error": null }),
            )
            .await?;
            self.finalize_completed(&workflow, &outputs).await?;
            return Ok(workflow);
        }

        // Parallel siblings complete with a barrier: record this
        // completion and wait for the rest of the group.
        if transition::parallel_group_busy(&workflow, step_idx) {
            workflow.updated_at = Utc::now();
            self.store.save_workflow(&workflow).await?;
            self.audit(
                workflow_id,
                AuditKind::StepCompleted,
                json!({ "step_num": step_num, "step_name": step_name, "error": null }),
            )
            .await?;
            return Ok(workflow);
        }

        // The last member of a parallel group advances from the group's
        // sequential frontier.
        if let Some(frontier) = transition::parallel_group_frontier(&workflow, step_idx) {
            if frontier > workflow.current_step {
                workflow.current_step = frontier;
            }
        }

        let transition_outcome =
            transition::advance_after_success(&mut workflow, step_idx, self.loop_limit);

        workflow.updated_at = Utc::now();
        if transition_outcome.loop_violation.is_some() {
            workflow.state = WorkflowState::Failed;
            workflow.completed_at = Some(Utc::now());
        }
        self.store.save_workflow(&workflow).await?;

        for skip in &transition_outcome.skipped {
            self.audit(
                workflow_id,
                AuditKind::StepSkipped,
                json!({
                    "step_num": skip.step_num,
                    "step_name": skip.step_name,
                    "condition": skip.condition,
                    "reason": skip.reason,
                }),
            )
            .await?;
        }

        self.audit(
            workflow_id,
            AuditKind::StepCompleted,
            json!({ "step_num": step_num, "step_name": step_name, "error": null }),
        )
        .await?;

        if let Some(violation) = transition_outcome.loop_violation {
            self.audit(
                workflow_id,
                AuditKind::WorkflowFailed,
                json!({
                    "reason": "loop iteration limit exceeded",
                    "step_name": violation.step,
                    "iteration": violation.iteration,
                    "limit": violation.limit,
                }),
            )
            .await?;
            tracing::error!(
                workflow_id,
                step = violation.step.as_str(),
                iteration = violation.iteration,
                limit = violation.limit,
                "goto re-entry exceeded loop limit, workflow failed"
            );
            return Ok(workflow);
        }

        if !transition_outcome.activated.is_empty() {
            self.announce_started(&workflow, &transition_outcome.activated).await?;
            if let Some(step) = workflow.step(transition_outcome.activated[0]) {
                if let Err(err) = self.hooks.on_step_transition(&workflow, step, &outputs).await {
                    tracing::error!(
                        workflow_id,
                        step = step.name.as_str(),
                        error = err.as_str(),
                        "on_step_transition hook failed"
                    );
                }
            }
        } else if workflow.state == WorkflowState::Completed {
            self.finalize_completed(&workflow, &outputs).await?;
        }

        tracing::info!(workflow_id, step_num, "completed step");
        Ok(workflow)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Bring a workflow with stale RUNNING steps back to a consistent
    /// state, per its `stale_running_step_action`.
    pub async fn reconcile_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state != WorkflowState::Running {
            return Ok(workflow);
        }

        let stale: Vec<usize> = workflow
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Running)
            .map(|(i, _)| i)
            .collect();
        if stale.is_empty() {
            return Ok(workflow);
        }

        match workflow.orchestration.stale_running_step_action {
            StaleStepAction::Reconcile => {
                for &idx in &stale {
                    workflow.steps[idx].status = StepStatus::Pending;
                    workflow.steps[idx].started_at = None;
                }
                let first = stale[0];
                let activated = transition::activate_step(&mut workflow, first);
                workflow.updated_at = Utc::now();
                self.store.save_workflow(&workflow).await?;
                self.announce_started(&workflow, &activated).await?;
                tracing::warn!(
                    workflow_id,
                    reactivated = workflow.steps[first].name.as_str(),
                    "reconciled stale running steps"
                );
            }
            StaleStepAction::FailWorkflow => {
                workflow.state = WorkflowState::Failed;
                workflow.completed_at = Some(Utc::now());
                workflow.updated_at = Utc::now();
                self.store.save_workflow(&workflow).await?;
                self.audit(
                    workflow_id,
                    AuditKind::WorkflowFailed,
                    json!({ "reason": "stale running step" }),
                )
                .await?;
                tracing::warn!(workflow_id, "stale running step failed the workflow");
            }
        }

        Ok(workflow)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load_required(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn audit(
        &self,
        workflow_id: &str,
        kind: AuditKind,
        data: Value,
    ) -> Result<(), EngineError> {
        let event = AuditEvent::new(workflow_id, kind, data);
        self.store.append_audit_event(&event).await?;
        Ok(())
    }

    /// Audit STEP_STARTED and publish StepStarted for activated steps.
    async fn announce_started(
        &self,
        workflow: &Workflow,
        activated: &[u32],
    ) -> Result<(), EngineError> {
        for &step_num in activated {
            let Some(step) = workflow.step(step_num) else {
                continue;
            };
            self.audit(
                &workflow.id,
                AuditKind::StepStarted,
                json!({
                    "step_num": step.step_num,
                    "step_name": step.name,
                    "agent_type": step.agent.name,
                }),
            )
            .await?;
            self.bus.publish(WorkflowEvent::StepStarted {
                workflow_id: workflow.id.clone(),
                step_num: step.step_num,
                step_name: step.name.clone(),
                agent_type: step.agent.name.clone(),
            });
        }
        Ok(())
    }

    /// Audit WORKFLOW_COMPLETED, publish the event, fire the hook.
    async fn finalize_completed(
        &self,
        workflow: &Workflow,
        outputs: &HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.audit(&workflow.id, AuditKind::WorkflowCompleted, json!({})).await?;
        self.bus.publish(WorkflowEvent::WorkflowCompleted {
            workflow_id: workflow.id.clone(),
        });
        if let Err(err) = self.hooks.on_workflow_complete(workflow, outputs).await {
            tracing::error!(
                workflow_id = workflow.id.as_str(),
                error = err.as_str(),
                "on_workflow_complete hook failed"
            );
        }
        tracing::info!(workflow_id = workflow.id.as_str(), "workflow completed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
