//! Pub-sub surface for the four workflow lifecycle events.
//!
//! Subscribers register by event kind: a launcher that only cares about
//! `StepStarted` never sees completion traffic, and an alerting hook can
//! watch `StepFailed` alone. Each kind gets its own channel, so a slow
//! consumer of one kind cannot lag the others. Emission is in-process
//! and fire-and-forget; a send with no subscribers (or to a lagged
//! receiver) never raises to the emitter.

use cadenza_types::event::{EventKind, WorkflowEvent};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Per-kind fan-out of `WorkflowEvent`s.
#[derive(Clone, Debug)]
pub struct EventBus {
    step_started: broadcast::Sender<WorkflowEvent>,
    step_completed: broadcast::Sender<WorkflowEvent>,
    step_failed: broadcast::Sender<WorkflowEvent>,
    workflow_completed: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus whose per-kind channels each hold up to `capacity`
    /// undelivered events before the oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let channel = || broadcast::channel(capacity).0;
        EventBus {
            step_started: channel(),
            step_completed: channel(),
            step_failed: channel(),
            workflow_completed: channel(),
        }
    }

    /// Register for one event kind. The receiver sees every matching
    /// event published after this call.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<WorkflowEvent> {
        self.channel(kind).subscribe()
    }

    /// Publish an event to the subscribers of its kind. Events with no
    /// subscribers are dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.channel(event.kind()).send(event);
    }

    /// Number of live subscribers for a kind. Lets drivers skip
    /// assembling expensive payloads nobody is listening for.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.channel(kind).receiver_count()
    }

    fn channel(&self, kind: EventKind) -> &broadcast::Sender<WorkflowEvent> {
        match kind {
            EventKind::StepStarted => &self.step_started,
            EventKind::StepCompleted => &self.step_completed,
            EventKind::StepFailed => &self.step_failed,
            EventKind::WorkflowCompleted => &self.workflow_completed,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
