//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `cadenza-core` using sqlx with split
//! read/write pools. Workflows are stored as JSON documents with
//! denormalized state/timestamp columns for filtering; the audit log is
//! append-only with insertion order preserved by its autoincrement id.

use std::collections::HashMap;

use cadenza_core::store::WorkflowStore;
use cadenza_types::error::StorageError;
use cadenza_types::event::AuditEvent;
use cadenza_types::workflow::{PendingApproval, Workflow, WorkflowState};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    document: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            document: row.try_get("document")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, StorageError> {
        serde_json::from_str(&self.document)
            .map_err(|e| StorageError::Query(format!("invalid workflow document JSON: {e}")))
    }
}

struct AuditRow {
    event_id: String,
    workflow_id: String,
    timestamp: String,
    event_type: String,
    data: String,
    user_id: Option<String>,
}

impl AuditRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            workflow_id: row.try_get("workflow_id")?,
            timestamp: row.try_get("timestamp")?,
            event_type: row.try_get("event_type")?,
            data: row.try_get("data")?,
            user_id: row.try_get("user_id")?,
        })
    }

    fn into_event(self) -> Result<AuditEvent, StorageError> {
        let id = self
            .event_id
            .parse()
            .map_err(|e| StorageError::Query(format!("invalid audit event id: {e}")))?;
        let data: Value = serde_json::from_str(&self.data)
            .map_err(|e| StorageError::Query(format!("invalid audit data JSON: {e}")))?;
        Ok(AuditEvent {
            id,
            workflow_id: self.workflow_id,
            timestamp: parse_datetime(&self.timestamp)?,
            event_type: self.event_type,
            data,
            user_id: self.user_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError> {
        let document = serde_json::to_string(workflow)
            .map_err(|e| StorageError::Query(format!("serialize workflow: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflows (id, name, state, document, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 state = excluded.state,
                 document = excluded.document,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(workflow.state.as_str())
        .bind(&document)
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .bind(workflow.completed_at.as_ref().map(format_datetime))
        .execute(self.pool.writer())
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, StorageError> {
        let row = sqlx::query("SELECT document FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(self.pool.reader())
            .await
            .map_err(query_err)?;

        row.map(|r| WorkflowRow::from_row(&r).map_err(query_err)?.into_workflow())
            .transpose()
    }

    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: u32,
    ) -> Result<Vec<Workflow>, StorageError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT document FROM workflows WHERE state = ? ORDER BY updated_at DESC LIMIT ?",
                )
                .bind(state.as_str())
                .bind(limit as i64)
                .fetch_all(self.pool.reader())
                .await
            }
            None => {
                sqlx::query("SELECT document FROM workflows ORDER BY updated_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(self.pool.reader())
                    .await
            }
        }
        .map_err(query_err)?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(WorkflowRow::from_row(row).map_err(query_err)?.into_workflow()?);
        }
        Ok(workflows)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .execute(self.pool.writer())
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let data = serde_json::to_string(&event.data)
            .map_err(|e| StorageError::Query(format!("serialize audit data: {e}")))?;

        sqlx::query(
            r#"INSERT INTO audit_log (event_id, workflow_id, timestamp, event_type, data, user_id)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(&event.workflow_id)
        .bind(format_datetime(&event.timestamp))
        .bind(&event.event_type)
        .bind(&data)
        .bind(&event.user_id)
        .execute(self.pool.writer())
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_audit_log(
        &self,
        workflow_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, StorageError> {
        let rows = sqlx::query(
            "SELECT event_id, workflow_id, timestamp, event_type, data, user_id
             FROM audit_log WHERE workflow_id = ? ORDER BY id ASC",
        )
        .bind(workflow_id)
        .fetch_all(self.pool.reader())
        .await
        .map_err(query_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let event = AuditRow::from_row(row).map_err(query_err)?.into_event()?;
            if since.is_none_or(|t| event.timestamp >= t) {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn save_agent_metadata(
        &self,
        workflow_id: &str,
        agent_name: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(metadata)
            .map_err(|e| StorageError::Query(format!("serialize agent metadata: {e}")))?;

        sqlx::query(
            r#"INSERT INTO agent_metadata (workflow_id, agent_name, metadata, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(workflow_id, agent_name) DO UPDATE SET
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow_id)
        .bind(agent_name)
        .bind(&payload)
        .bind(format_datetime(&Utc::now()))
        .execute(self.pool.writer())
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_agent_metadata(
        &self,
        workflow_id: &str,
        agent_name: &str,
    ) -> Result<Option<HashMap<String, Value>>, StorageError> {
        let row = sqlx::query(
            "SELECT metadata FROM agent_metadata WHERE workflow_id = ? AND agent_name = ?",
        )
        .bind(workflow_id)
        .bind(agent_name)
        .fetch_optional(self.pool.reader())
        .await
        .map_err(query_err)?;

        row.map(|r| {
            let payload: String = r.try_get("metadata").map_err(query_err)?;
            serde_json::from_str(&payload)
                .map_err(|e| StorageError::Query(format!("invalid agent metadata JSON: {e}")))
        })
        .transpose()
    }

    async fn map_issue_to_workflow(
        &self,
        issue: &str,
        workflow_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO issue_mappings (issue, workflow_id, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(issue) DO UPDATE SET
                 workflow_id = excluded.workflow_id,
                 updated_at = excluded.updated_at"#,
        )
        .bind(issue)
        .bind(workflow_id)
        .bind(format_datetime(&Utc::now()))
        .execute(self.pool.writer())
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_workflow_id_for_issue(&self, issue: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT workflow_id FROM issue_mappings WHERE issue = ?")
            .bind(issue)
            .fetch_optional(self.pool.reader())
            .await
            .map_err(query_err)?;

        row.map(|r| r.try_get::<String, _>("workflow_id").map_err(query_err))
            .transpose()
    }

    async fn remove_issue_workflow_mapping(&self, issue: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM issue_mappings WHERE issue = ?")
            .bind(issue)
            .execute(self.pool.writer())
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn load_issue_workflow_mappings(&self) -> Result<HashMap<String, String>, StorageError> {
        let rows = sqlx::query("SELECT issue, workflow_id FROM issue_mappings")
            .fetch_all(self.pool.reader())
            .await
            .map_err(query_err)?;

        let mut mappings = HashMap::with_capacity(rows.len());
        for row in &rows {
            let issue: String = row.try_get("issue").map_err(query_err)?;
            let workflow_id: String = row.try_get("workflow_id").map_err(query_err)?;
            mappings.insert(issue, workflow_id);
        }
        Ok(mappings)
    }

    async fn set_pending_workflow_approval(
        &self,
        issue: &str,
        approval: &PendingApproval,
    ) -> Result<(), StorageError> {
        let approvers = serde_json::to_string(&approval.approvers)
            .map_err(|e| StorageError::Query(format!("serialize approvers: {e}")))?;

        sqlx::query(
            r#"INSERT INTO pending_approvals (issue, step_num, step_name, approvers, timeout_secs, requested_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(issue) DO UPDATE SET
                 step_num = excluded.step_num,
                 step_name = excluded.step_name,
                 approvers = excluded.approvers,
                 timeout_secs = excluded.timeout_secs,
                 requested_at = excluded.requested_at"#,
        )
        .bind(issue)
        .bind(approval.step_num as i64)
        .bind(&approval.step_name)
        .bind(&approvers)
        .bind(approval.timeout_secs as i64)
        .bind(format_datetime(&approval.requested_at))
        .execute(self.pool.writer())
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn clear_pending_workflow_approval(&self, issue: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_approvals WHERE issue = ?")
            .bind(issue)
            .execute(self.pool.writer())
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_pending_workflow_approval(
        &self,
        issue: &str,
    ) -> Result<Option<PendingApproval>, StorageError> {
        let row = sqlx::query(
            "SELECT step_num, step_name, approvers, timeout_secs, requested_at
             FROM pending_approvals WHERE issue = ?",
        )
        .bind(issue)
        .fetch_optional(self.pool.reader())
        .await
        .map_err(query_err)?;

        row.map(|r| approval_from_row(&r)).transpose()
    }

    async fn load_pending_workflow_approvals(
        &self,
    ) -> Result<HashMap<String, PendingApproval>, StorageError> {
        let rows = sqlx::query(
            "SELECT issue, step_num, step_name, approvers, timeout_secs, requested_at
             FROM pending_approvals",
        )
        .fetch_all(self.pool.reader())
        .await
        .map_err(query_err)?;

        let mut approvals = HashMap::with_capacity(rows.len());
        for row in &rows {
            let issue: String = row.try_get("issue").map_err(query_err)?;
            approvals.insert(issue, approval_from_row(row)?);
        }
        Ok(approvals)
    }

    async fn cleanup_old_workflows(&self, older_than_days: u32) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);

        let rows = sqlx::query(
            "SELECT id, updated_at FROM workflows WHERE state IN ('completed', 'failed', 'cancelled')",
        )
        .fetch_all(self.pool.reader())
        .await
        .map_err(query_err)?;

        let mut stale = Vec::new();
        for row in &rows {
            let id: String = row.try_get("id").map_err(query_err)?;
            let updated_at: String = row.try_get("updated_at").map_err(query_err)?;
            if parse_datetime(&updated_at)? < cutoff {
                stale.push(id);
            }
        }

        for workflow_id in &stale {
            // pending approvals cascade away with their issue mappings
            sqlx::query("DELETE FROM issue_mappings WHERE workflow_id = ?")
                .bind(workflow_id)
                .execute(self.pool.writer())
                .await
                .map_err(query_err)?;
            sqlx::query("DELETE FROM workflows WHERE id = ?")
                .bind(workflow_id)
                .execute(self.pool.writer())
                .await
                .map_err(query_err)?;
        }

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), older_than_days, "cleaned up old workflows");
        }
        Ok(stale.len() as u64)
    }
}

fn approval_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PendingApproval, StorageError> {
    let approvers_raw: String = row.try_get("approvers").map_err(query_err)?;
    let approvers: Vec<String> = serde_json::from_str(&approvers_raw)
        .map_err(|e| StorageError::Query(format!("invalid approvers JSON: {e}")))?;
    let step_num: i64 = row.try_get("step_num").map_err(query_err)?;
    let timeout_secs: i64 = row.try_get("timeout_secs").map_err(query_err)?;
    let requested_at: String = row.try_get("requested_at").map_err(query_err)?;

    Ok(PendingApproval {
        step_num: step_num as u32,
        step_name: row.try_get("step_name").map_err(query_err)?,
        approvers,
        timeout_secs: timeout_secs as u64,
        requested_at: parse_datetime(&requested_at)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
