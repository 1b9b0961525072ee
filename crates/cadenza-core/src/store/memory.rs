//! In-memory store and ledger.
//!
//! Process-local implementations of the storage ports, used as test
//! doubles and as a lightweight backend for dry runs and examples.
//! Audit entries keep insertion order; the ledger evicts its oldest keys
//! once capacity is reached.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use cadenza_types::error::StorageError;
use cadenza_types::event::AuditEvent;
use cadenza_types::workflow::{PendingApproval, Workflow, WorkflowState};

use super::{CompletionLedger, WorkflowStore};

/// In-memory `WorkflowStore`.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: DashMap<String, Workflow>,
    audit: Mutex<Vec<AuditEvent>>,
    agent_metadata: DashMap<(String, String), HashMap<String, Value>>,
    issue_mappings: DashMap<String, String>,
    approvals: DashMap<String, PendingApproval>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError> {
        self.workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, StorageError> {
        Ok(self.workflows.get(workflow_id).map(|w| w.clone()))
    }

    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: u32,
    ) -> Result<Vec<Workflow>, StorageError> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|w| state.is_none_or(|s| w.state == s))
            .collect();
        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        workflows.truncate(limit as usize);
        Ok(workflows)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, StorageError> {
        Ok(self.workflows.remove(workflow_id).is_some())
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let mut audit = self
            .audit
            .lock()
            .map_err(|_| StorageError::Query("audit lock poisoned".to_string()))?;
        audit.push(event.clone());
        Ok(())
    }

    async fn get_audit_log(
        &self,
        workflow_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, StorageError> {
        let audit = self
            .audit
            .lock()
            .map_err(|_| StorageError::Query("audit lock poisoned".to_string()))?;
        Ok(audit
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .filter(|e| since.is_none_or(|t| e.timestamp >= t))
            .cloned()
            .collect())
    }

    async fn save_agent_metadata(
        &self,
        workflow_id: &str,
        agent_name: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        self.agent_metadata.insert(
            (workflow_id.to_string(), agent_name.to_string()),
            metadata.clone(),
        );
        Ok(())
    }

    async fn get_agent_metadata(
        &self,
        workflow_id: &str,
        agent_name: &str,
    ) -> Result<Option<HashMap<String, Value>>, StorageError> {
        Ok(self
            .agent_metadata
            .get(&(workflow_id.to_string(), agent_name.to_string()))
            .map(|m| m.clone()))
    }

    async fn map_issue_to_workflow(
        &self,
        issue: &str,
        workflow_id: &str,
    ) -> Result<(), StorageError> {
        self.issue_mappings
            .insert(issue.to_string(), workflow_id.to_string());
        Ok(())
    }

    async fn get_workflow_id_for_issue(&self, issue: &str) -> Result<Option<String>, StorageError> {
        Ok(self.issue_mappings.get(issue).map(|id| id.clone()))
    }

    async fn remove_issue_workflow_mapping(&self, issue: &str) -> Result<(), StorageError> {
        self.issue_mappings.remove(issue);
        Ok(())
    }

    async fn load_issue_workflow_mappings(&self) -> Result<HashMap<String, String>, StorageError> {
        Ok(self
            .issue_mappings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn set_pending_workflow_approval(
        &self,
        issue: &str,
        approval: &PendingApproval,
    ) -> Result<(), StorageError> {
        self.approvals.insert(issue.to_string(), approval.clone());
        Ok(())
    }

    async fn clear_pending_workflow_approval(&self, issue: &str) -> Result<(), StorageError> {
        self.approvals.remove(issue);
        Ok(())
    }

    async fn get_pending_workflow_approval(
        &self,
        issue: &str,
    ) -> Result<Option<PendingApproval>, StorageError> {
        Ok(self.approvals.get(issue).map(|a| a.clone()))
    }

    async fn load_pending_workflow_approvals(
        &self,
    ) -> Result<HashMap<String, PendingApproval>, StorageError> {
        Ok(self
            .approvals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn cleanup_old_workflows(&self, older_than_days: u32) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let stale: Vec<String> = self
            .workflows
            .iter()
            .filter(|entry| entry.value().state.is_terminal() && entry.value().updated_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len() as u64;
        for id in stale {
            self.workflows.remove(&id);
        }
        Ok(count)
    }
}

/// In-memory, size-bounded `CompletionLedger`.
pub struct MemoryCompletionLedger {
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    /// Keys in insertion order, oldest first.
    order: Vec<String>,
    capacity: usize,
}

impl MemoryCompletionLedger {
    pub fn new(capacity: usize) -> Self {
        MemoryCompletionLedger {
            inner: Mutex::new(LedgerInner {
                order: Vec::new(),
                capacity: capacity.max(1),
            }),
        }
    }
}

impl CompletionLedger for MemoryCompletionLedger {
    async fn check_and_insert(&self, key: &str) -> Result<bool, StorageError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StorageError::Query("ledger lock poisoned".to_string()))?;

        if inner.order.iter().any(|k| k == key) {
            return Ok(false);
        }
        inner.order.push(key.to_string());
        while inner.order.len() > inner.capacity {
            inner.order.remove(0);
        }
        Ok(true)
    }

    async fn len(&self) -> Result<u64, StorageError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StorageError::Query("ledger lock poisoned".to_string()))?;
        Ok(inner.order.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
