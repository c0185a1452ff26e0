use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::{ExecutionResult, TransportError};
use crate::runner::ResourceUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    /// QUEUED -> RUNNING | CANCELLED, RUNNING -> COMPLETED | FAILED | TIMEOUT.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "QUEUED"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Completed => write!(f, "COMPLETED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
            ExecutionStatus::Timeout => write!(f, "TIMEOUT"),
            ExecutionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Lifecycle record of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub artifact_id: Option<String>,
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Milliseconds, as reported by the orchestrator
    pub duration: Option<u64>,
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(input: Option<serde_json::Value>) -> Self {
        Self::with_id(Uuid::new_v4(), input)
    }

    pub fn with_id(id: Uuid, input: Option<serde_json::Value>) -> Self {
        Self {
            id,
            artifact_id: None,
            user_id: None,
            status: ExecutionStatus::Queued,
            input,
            output: None,
            error: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            duration: None,
            resource_usage: None,
            warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn owned_by(mut self, artifact_id: Option<String>, user_id: Option<String>) -> Self {
        self.artifact_id = artifact_id;
        self.user_id = user_id;
        self
    }

    /// Copy a terminal outcome onto the record.
    pub(crate) fn apply(&mut self, outcome: ExecutionOutcome, completed_at: DateTime<Utc>) {
        self.status = outcome.status;
        self.output = outcome.output;
        self.error = outcome.error;
        self.exit_code = outcome.exit_code;
        self.stdout = outcome.stdout;
        self.stderr = outcome.stderr;
        self.duration = outcome.duration;
        self.resource_usage = outcome.resource_usage;
        self.warnings = outcome.warnings;
        self.completed_at = Some(completed_at);
    }
}

/// Everything written to a record on its terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration: Option<u64>,
    pub resource_usage: Option<ResourceUsage>,
    pub warnings: Vec<String>,
}

impl ExecutionOutcome {
    /// COMPLETED when the runner succeeded, FAILED otherwise.
    pub fn from_result(result: ExecutionResult) -> Self {
        Self {
            status: if result.is_success() {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            },
            output: result.output,
            error: result.error,
            exit_code: result.exit_code,
            stdout: Some(result.stdout),
            stderr: Some(result.stderr),
            duration: Some(result.duration),
            resource_usage: Some(result.resource_usage),
            warnings: result.warnings,
        }
    }

    /// TIMEOUT for time-based transport failures, FAILED for the rest.
    pub fn from_transport(err: &TransportError) -> Self {
        let status = if err.is_time_based() {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failed
        };
        Self::terminal(status, err.to_string())
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::terminal(ExecutionStatus::Failed, error)
    }

    fn terminal(status: ExecutionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            output: None,
            error: Some(error.into()),
            exit_code: None,
            stdout: None,
            stderr: None,
            duration: None,
            resource_usage: None,
            warnings: Vec::new(),
        }
    }
}
