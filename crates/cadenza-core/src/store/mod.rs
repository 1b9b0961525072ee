//! Storage-port trait definitions.
//!
//! These traits define the persistence interface the infrastructure layer
//! (cadenza-infra) implements. The core crate never depends on any
//! specific storage technology; tests replace the ports with the in-memory
//! doubles from `store::memory`.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

pub mod memory;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use cadenza_types::error::StorageError;
use cadenza_types::event::AuditEvent;
use cadenza_types::workflow::{PendingApproval, Workflow, WorkflowState};

/// Persistence port for workflows, the audit ledger, agent metadata,
/// issue mappings and pending approvals.
///
/// The store is the authoritative source of truth: the engine never
/// caches workflows beyond the scope of a single operation.
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow by id.
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn load_workflow(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, StorageError>> + Send;

    /// List workflows, optionally filtered by state, most recent first.
    fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, StorageError>> + Send;

    /// Delete a workflow. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Audit ledger
    // -----------------------------------------------------------------------

    /// Append an audit entry. The append is durable before this returns.
    fn append_audit_event(
        &self,
        event: &AuditEvent,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Audit entries for a workflow in insertion order, optionally only
    /// those at or after `since`.
    fn get_audit_log(
        &self,
        workflow_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<Vec<AuditEvent>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Agent metadata
    // -----------------------------------------------------------------------

    /// Save agent execution metadata (PID, heartbeat timestamps, etc.).
    fn save_agent_metadata(
        &self,
        workflow_id: &str,
        agent_name: &str,
        metadata: &HashMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn get_agent_metadata(
        &self,
        workflow_id: &str,
        agent_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<HashMap<String, Value>>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Issue mappings
    // -----------------------------------------------------------------------

    /// Map an external id to a workflow id. Last writer wins.
    fn map_issue_to_workflow(
        &self,
        issue: &str,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn get_workflow_id_for_issue(
        &self,
        issue: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, StorageError>> + Send;

    fn remove_issue_workflow_mapping(
        &self,
        issue: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn load_issue_workflow_mappings(
        &self,
    ) -> impl std::future::Future<Output = Result<HashMap<String, String>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Pending approvals
    // -----------------------------------------------------------------------

    fn set_pending_workflow_approval(
        &self,
        issue: &str,
        approval: &PendingApproval,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn clear_pending_workflow_approval(
        &self,
        issue: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn get_pending_workflow_approval(
        &self,
        issue: &str,
    ) -> impl std::future::Future<Output = Result<Option<PendingApproval>, StorageError>> + Send;

    fn load_pending_workflow_approvals(
        &self,
    ) -> impl std::future::Future<Output = Result<HashMap<String, PendingApproval>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Delete terminal workflows older than the given age. Returns the
    /// number deleted.
    fn cleanup_old_workflows(
        &self,
        older_than_days: u32,
    ) -> impl std::future::Future<Output = Result<u64, StorageError>> + Send;
}

/// Persistent set of composite completion-signal keys.
///
/// Insertion is the gate that decides whether a completion signal is
/// processed: a key that was already present means the signal is a
/// duplicate and must be silently ignored. The set is size-bounded; the
/// oldest entries are evicted first. Must survive restarts.
pub trait CompletionLedger: Send + Sync {
    /// Insert `key` if absent. Returns `true` when the key was newly
    /// inserted (process the signal) and `false` when it was already
    /// present (suppress the signal).
    fn check_and_insert(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;

    /// Number of keys currently retained.
    fn len(&self) -> impl std::future::Future<Output = Result<u64, StorageError>> + Send;
}
