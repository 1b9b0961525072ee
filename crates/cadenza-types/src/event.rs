//! Event types for the Cadenza workflow event bus and audit ledger.
//!
//! `WorkflowEvent` is the typed event broadcast in-process while a workflow
//! advances. `AuditEvent` is the durable, append-only record persisted per
//! workflow; its `event_type` strings are stable and enumerated by
//! `AuditKind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Bus events
// ---------------------------------------------------------------------------

/// Events published on the in-process event bus as the state machine
/// advances. All variants are Clone + Send + Sync for use with tokio
/// broadcast channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A step has been activated.
    StepStarted {
        workflow_id: String,
        step_num: u32,
        step_name: String,
        agent_type: String,
    },

    /// A step completed successfully.
    StepCompleted {
        workflow_id: String,
        step_num: u32,
        step_name: String,
    },

    /// A step failed (terminally or pending a retry).
    StepFailed {
        workflow_id: String,
        step_num: u32,
        step_name: String,
        error: String,
        will_retry: bool,
    },

    /// The workflow reached COMPLETED.
    WorkflowCompleted { workflow_id: String },
}

/// The four event types subscribers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StepStarted,
    StepCompleted,
    StepFailed,
    WorkflowCompleted,
}

impl WorkflowEvent {
    /// The workflow this event belongs to.
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::StepStarted { workflow_id, .. }
            | WorkflowEvent::StepCompleted { workflow_id, .. }
            | WorkflowEvent::StepFailed { workflow_id, .. }
            | WorkflowEvent::WorkflowCompleted { workflow_id } => workflow_id,
        }
    }

    /// The subscription kind this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            WorkflowEvent::StepStarted { .. } => EventKind::StepStarted,
            WorkflowEvent::StepCompleted { .. } => EventKind::StepCompleted,
            WorkflowEvent::StepFailed { .. } => EventKind::StepFailed,
            WorkflowEvent::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Stable audit event-type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditKind {
    WorkflowCreated,
    WorkflowStarted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetry,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::WorkflowCreated => "WORKFLOW_CREATED",
            AuditKind::WorkflowStarted => "WORKFLOW_STARTED",
            AuditKind::WorkflowPaused => "WORKFLOW_PAUSED",
            AuditKind::WorkflowResumed => "WORKFLOW_RESUMED",
            AuditKind::WorkflowCompleted => "WORKFLOW_COMPLETED",
            AuditKind::WorkflowFailed => "WORKFLOW_FAILED",
            AuditKind::StepStarted => "STEP_STARTED",
            AuditKind::StepCompleted => "STEP_COMPLETED",
            AuditKind::StepFailed => "STEP_FAILED",
            AuditKind::StepSkipped => "STEP_SKIPPED",
            AuditKind::StepRetry => "STEP_RETRY",
            AuditKind::ApprovalRequested => "APPROVAL_REQUESTED",
            AuditKind::ApprovalGranted => "APPROVAL_GRANTED",
            AuditKind::ApprovalDenied => "APPROVAL_DENIED",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single immutable audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// UUIDv7 record id, time-sortable.
    pub id: Uuid,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    /// Stable event-type string (see `AuditKind`).
    pub event_type: String,
    /// Free-form event payload.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl AuditEvent {
    pub fn new(workflow_id: impl Into<String>, kind: AuditKind, data: Value) -> Self {
        AuditEvent {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            timestamp: Utc::now(),
            event_type: kind.as_str().to_string(),
            data,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.to_rfc3339(),
            self.event_type,
            self.workflow_id
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
