//! Workflow domain types for Cadenza.
//!
//! Defines the in-memory model the engine operates on: `Workflow` with its
//! ordered `WorkflowStep` sequence, the `Agent` identity bound to each step,
//! approval gates, router routes, and per-workflow orchestration parameters.
//!
//! Steps live in a flat sequence indexed by `step_num`; every edge between
//! steps (`on_success`, route targets, `parallel_with`) is a stable string
//! id resolved by lookup. This keeps the graph cycle-friendly and makes
//! persistence a single JSON document.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall execution state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Terminal states carry a `completed_at` timestamp and accept no
    /// further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowState::Pending),
            "running" => Ok(WorkflowState::Running),
            "paused" => Ok(WorkflowState::Paused),
            "completed" => Ok(WorkflowState::Completed),
            "failed" => Ok(WorkflowState::Failed),
            "cancelled" => Ok(WorkflowState::Cancelled),
            other => Err(format!("invalid workflow state: '{other}'")),
        }
    }
}

/// Execution status of an individual step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry / orchestration enums
// ---------------------------------------------------------------------------

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Constant,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Constant => "constant",
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "constant" => Ok(BackoffStrategy::Constant),
            other => Err(format!("invalid backoff strategy: '{other}'")),
        }
    }
}

/// What to do when an agent exceeds its liveness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Retry,
    FailStep,
    AlertOnly,
}

impl std::str::FromStr for TimeoutAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(TimeoutAction::Retry),
            "fail_step" => Ok(TimeoutAction::FailStep),
            "alert_only" => Ok(TimeoutAction::AlertOnly),
            other => Err(format!("invalid timeout action: '{other}'")),
        }
    }
}

/// Recovery policy for steps left RUNNING by a crashed driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleStepAction {
    Reconcile,
    FailWorkflow,
}

impl std::str::FromStr for StaleStepAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile" => Ok(StaleStepAction::Reconcile),
            "fail_workflow" => Ok(StaleStepAction::FailWorkflow),
            other => Err(format!("invalid stale step action: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Approval gates
// ---------------------------------------------------------------------------

/// Kinds of approval gates that can be attached to workflow steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalGateKind {
    PrMerge,
    Deployment,
    DataAccess,
    Custom,
}

/// Approval policy attached to a step.
///
/// A required gate blocks the named tool patterns and injects its
/// constraint message into the agent's prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub kind: ApprovalGateKind,
    /// If true, human approval is required before the restricted
    /// operations may run.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Blocked commands/tools (substring patterns).
    #[serde(default)]
    pub tool_restrictions: Vec<String>,
    /// Constraint message injected into prompt composition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl ApprovalGate {
    /// The standard PR-merge gate applied workflow-wide when
    /// `require_human_merge_approval` is set.
    pub fn pr_merge_gate() -> Self {
        ApprovalGate {
            kind: ApprovalGateKind::PrMerge,
            required: true,
            tool_restrictions: vec![
                "gh pr merge".to_string(),
                "git push origin main".to_string(),
                "git push origin master".to_string(),
            ],
            approval_message: Some(
                "**PR MERGE APPROVAL POLICY:**\n\
                 DO NOT merge Pull Requests automatically.\n\
                 DO NOT use `gh pr merge`.\n\
                 You MAY create PRs with `gh pr create` and post the PR link \
                 in your completion comment.\n\
                 Human approval is REQUIRED before merge."
                    .to_string(),
            ),
            metadata: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The logical worker identity bound to a step.
///
/// `name` is the stable identifier used to match external completion
/// signals to RUNNING steps. Immutable after workflow creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Provider-preference hint consumed by the external launcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_preference: Option<String>,
    /// Default execution timeout in seconds.
    pub timeout_secs: u64,
    /// Default retry budget, overridable per step.
    pub max_retries: u32,
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.name)
    }
}

// ---------------------------------------------------------------------------
// Router routes
// ---------------------------------------------------------------------------

/// One branch of a router step.
///
/// A route either carries a `when` expression with a `then`/`goto` target,
/// or is a default route: `default` is truthy and `when` is absent. The
/// default's target may be given as `then`/`goto`, or directly as the
/// string value of `default` itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Route {
    /// The explicit target of this route (`goto` wins over `then`).
    pub fn target(&self) -> Option<&str> {
        self.goto.as_deref().or(self.then.as_deref())
    }

    /// A route is a default branch when its `default` marker is truthy
    /// and it has no `when` guard.
    pub fn is_default(&self) -> bool {
        if self.when.is_some() {
            return false;
        }
        match &self.default {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Target of a default route: explicit target, else the string value
    /// of the `default` marker.
    pub fn default_target(&self) -> Option<&str> {
        self.target().or(match &self.default {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// One node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// 1-based, dense position in the declaration order.
    pub step_num: u32,
    /// Stable step id used by `on_success`, routes and `parallel_with`.
    pub name: String,
    pub agent: Agent,
    pub prompt_template: String,
    /// Optional guard expression; a false result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-step timeout override (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Per-step retry budget override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_strategy: Option<BackoffStrategy>,
    /// Initial delay in seconds before the first retry.
    #[serde(default)]
    pub initial_delay_secs: f64,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retries attempted so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub approval_gates: Vec<ApprovalGate>,
    /// Router branch definitions. Non-empty routes make this a router step.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Named successor id activated after success instead of the next
    /// sequential step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    /// Completing this step completes the workflow.
    #[serde(default)]
    pub final_step: bool,
    /// Times this step has been re-activated via a goto re-entry.
    /// Monotonically non-decreasing.
    #[serde(default)]
    pub iteration: u32,
    /// Step ids that run alongside this step.
    #[serde(default)]
    pub parallel_with: Vec<String>,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl WorkflowStep {
    /// Build a pending step with empty transient state.
    pub fn new(step_num: u32, name: impl Into<String>, agent: Agent, prompt: impl Into<String>) -> Self {
        WorkflowStep {
            step_num,
            name: name.into(),
            agent,
            prompt_template: prompt.into(),
            condition: None,
            timeout_secs: None,
            retry: None,
            backoff_strategy: None,
            initial_delay_secs: 0.0,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            approval_gates: Vec::new(),
            routes: Vec::new(),
            on_success: None,
            final_step: false,
            iteration: 0,
            parallel_with: Vec::new(),
        }
    }

    /// Router steps are regular steps with a non-empty route list; the
    /// transition service branches on this rather than on a subtype.
    pub fn is_router(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Retry budget for this step: per-step override, else the supplied
    /// workflow default.
    pub fn effective_max_retries(&self, default_max: u32) -> u32 {
        self.retry.unwrap_or(default_max)
    }

    /// Whether a required gate of the given kind is attached.
    pub fn has_approval_gate(&self, kind: ApprovalGateKind) -> bool {
        self.approval_gates
            .iter()
            .any(|g| g.kind == kind && g.required)
    }

    /// Combined constraint messages of all required gates.
    pub fn approval_constraints(&self) -> String {
        let messages: Vec<&str> = self
            .approval_gates
            .iter()
            .filter(|g| g.required)
            .filter_map(|g| g.approval_message.as_deref())
            .collect();
        messages.join("\n\n")
    }

    /// Deduplicated tool restrictions from all required gates.
    pub fn tool_restrictions(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut restrictions = Vec::new();
        for gate in self.approval_gates.iter().filter(|g| g.required) {
            for pattern in &gate.tool_restrictions {
                if seen.insert(pattern.as_str()) {
                    restrictions.push(pattern.clone());
                }
            }
        }
        restrictions
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step {}: {} ({})", self.step_num, self.name, self.agent.name)
    }
}

// ---------------------------------------------------------------------------
// OrchestrationConfig
// ---------------------------------------------------------------------------

/// Per-workflow operational parameters for the polling driver and the
/// retry/recovery machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub interval_seconds: u64,
    /// Glob matched against the workspace for completion summaries.
    /// Must resolve inside the workspace root.
    pub completion_glob: String,
    pub dedupe_cache_size: usize,
    pub default_agent_timeout_seconds: u64,
    /// Consecutive polling windows without a heartbeat before
    /// `timeout_action` is applied.
    pub liveness_miss_threshold: u32,
    pub timeout_action: TimeoutAction,
    pub chaining_enabled: bool,
    pub require_completion_comment: bool,
    pub block_on_closed_issue: bool,
    pub max_retries_per_step: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_seconds: f64,
    pub stale_running_step_action: StaleStepAction,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        OrchestrationConfig {
            interval_seconds: 15,
            completion_glob: ".cadenza/tasks/completions/completion_summary_*.json".to_string(),
            dedupe_cache_size: 500,
            default_agent_timeout_seconds: 3600,
            liveness_miss_threshold: 3,
            timeout_action: TimeoutAction::Retry,
            chaining_enabled: true,
            require_completion_comment: true,
            block_on_closed_issue: true,
            max_retries_per_step: 2,
            backoff: BackoffStrategy::Exponential,
            initial_delay_seconds: 1.0,
            stale_running_step_action: StaleStepAction::Reconcile,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Complete workflow definition and execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_workflow_state")]
    pub state: WorkflowState,
    /// Step number of the most-recently-activated non-parallel step,
    /// or 0 before start.
    #[serde(default)]
    pub current_step: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Workflow-level PR merge approval policy.
    #[serde(default = "default_true")]
    pub require_human_merge_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

fn default_workflow_state() -> WorkflowState {
    WorkflowState::Pending
}

impl Workflow {
    /// Build a pending workflow with no steps.
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        let now = Utc::now();
        Workflow {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            steps: Vec::new(),
            state: WorkflowState::Pending,
            current_step: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: HashMap::new(),
            require_human_merge_approval: true,
            schema_version: None,
            orchestration: OrchestrationConfig::default(),
        }
    }

    /// Get a step by its 1-based number.
    pub fn step(&self, step_num: u32) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_num == step_num)
    }

    pub fn step_mut(&mut self, step_num: u32) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.step_num == step_num)
    }

    /// Get a step by its stable id.
    pub fn step_by_name(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Index into `steps` of the step with the given stable id.
    pub fn step_index_by_name(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// The next step in declaration order after `current_step`.
    pub fn next_step(&self) -> Option<&WorkflowStep> {
        self.step(self.current_step + 1)
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    /// Agent name of the currently RUNNING step, or None.
    ///
    /// Useful after `complete_step` to discover which agent should run
    /// next without inspecting individual steps.
    pub fn active_agent_type(&self) -> Option<&str> {
        self.step(self.current_step)
            .filter(|s| s.status == StepStatus::Running)
            .map(|s| s.agent.name.as_str())
    }

    /// Apply workflow-level approval gates to all steps.
    ///
    /// Call after loading from a definition so workflow-level policies
    /// reach individual steps.
    pub fn apply_approval_gates(&mut self) {
        if !self.require_human_merge_approval {
            return;
        }
        for step in &mut self.steps {
            if !step.has_approval_gate(ApprovalGateKind::PrMerge) {
                step.approval_gates.push(ApprovalGate::pr_merge_gate());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pending approvals / completion signals / dry-run report
// ---------------------------------------------------------------------------

/// One pending approval gate per external id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step_num: u32,
    pub step_name: String,
    /// Approver identifiers, in notification order.
    pub approvers: Vec<String>,
    pub timeout_secs: u64,
    pub requested_at: DateTime<Utc>,
}

/// External completion signal consumed by the issue adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSignal {
    /// External identifier (e.g. a ticket number).
    pub issue: String,
    /// Stable agent name reported by the completing agent.
    pub agent_type: String,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    /// Dedupe key component; when absent, the idempotency ledger is
    /// skipped and the signal is always processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl CompletionSignal {
    /// Composite ledger key `{issue}:{agent_type}:{event_id}`, or None
    /// when no event id was supplied.
    pub fn ledger_key(&self) -> Option<String> {
        self.event_id
            .as_deref()
            .map(|event_id| format!("{}:{}:{}", self.issue, self.agent_type, event_id))
    }
}

/// Result of a workflow dry-run validation and simulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunReport {
    pub errors: Vec<String>,
    /// One `RUN`/`SKIP` line per non-router step.
    pub predicted_flow: Vec<String>,
}

impl DryRunReport {
    /// True when no configuration errors were detected.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
