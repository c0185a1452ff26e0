use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ExecError, Result};
use crate::execution::record::{Execution, ExecutionOutcome, ExecutionStatus};

/// Error written onto records a previous process left RUNNING.
pub const INTERRUPTED_ERROR: &str = "Execution interrupted by service restart";

/// Persistence for execution records.
///
/// Every transition goes through [`ExecutionStatus::can_transition_to`], so
/// no implementation can move a record out of a terminal state.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: Execution) -> Result<()>;

    async fn get(&self, id: &Uuid) -> Option<Execution>;

    /// All records, oldest first.
    async fn list(&self) -> Vec<Execution>;

    /// QUEUED -> RUNNING and set `started_at`. Returns false when the record
    /// is no longer QUEUED (cancelled, say) so the caller skips it.
    async fn mark_running(&self, id: &Uuid) -> Result<bool>;

    /// Write the terminal outcome and `completed_at`.
    async fn finish(&self, id: &Uuid, outcome: ExecutionOutcome) -> Result<Execution>;

    /// QUEUED -> CANCELLED.
    async fn cancel(&self, id: &Uuid) -> Result<Execution>;

    /// Move every RUNNING record to FAILED. Returns the ids touched.
    async fn reconcile_stale(&self) -> Vec<Uuid>;
}

/// Execution records held in memory
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<Uuid, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_transition(execution: &Execution, to: ExecutionStatus) -> Result<()> {
    if execution.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(ExecError::InvalidTransition {
            id: execution.id,
            from: execution.status,
            to,
        })
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, execution: Execution) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&execution.id) {
            return Err(ExecError::AlreadyExists(execution.id));
        }
        records.insert(execution.id, execution);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Option<Execution> {
        self.records.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    async fn mark_running(&self, id: &Uuid) -> Result<bool> {
        let mut records = self.records.write().await;
        let execution = records
            .get_mut(id)
            .ok_or(ExecError::ExecutionNotFound(*id))?;
        if execution.status != ExecutionStatus::Queued {
            return Ok(false);
        }
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn finish(&self, id: &Uuid, outcome: ExecutionOutcome) -> Result<Execution> {
        let mut records = self.records.write().await;
        let execution = records
            .get_mut(id)
            .ok_or(ExecError::ExecutionNotFound(*id))?;
        check_transition(execution, outcome.status)?;
        execution.apply(outcome, Utc::now());
        Ok(execution.clone())
    }

    async fn cancel(&self, id: &Uuid) -> Result<Execution> {
        let mut records = self.records.write().await;
        let execution = records
            .get_mut(id)
            .ok_or(ExecError::ExecutionNotFound(*id))?;
        check_transition(execution, ExecutionStatus::Cancelled)?;
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(Utc::now());
        Ok(execution.clone())
    }

    async fn reconcile_stale(&self) -> Vec<Uuid> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let mut touched = Vec::new();
        for execution in records.values_mut() {
            if execution.status == ExecutionStatus::Running {
                execution.apply(ExecutionOutcome::failed(INTERRUPTED_ERROR), now);
                touched.push(execution.id);
            }
        }
        touched
    }
}
