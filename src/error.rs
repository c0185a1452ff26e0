use thiserror::Error;
use uuid::Uuid;

use crate::execution::ExecutionStatus;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized imports: {}", .0.join(", "))]
    UnauthorizedImports(Vec<String>),

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("{0}")]
    ResourceExceeded(String),

    #[error("Runner fault: {0}")]
    RunnerFault(String),

    #[error("Orchestration fault: {0}")]
    Orchestration(String),

    #[error("No runner available for type '{artifact_type}' or language '{language}'")]
    NoRunner {
        artifact_type: String,
        language: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] crate::orchestrator::client::TransportError),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Execution already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Invalid transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Stable machine-readable code used in HTTP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::Validation(_) | ExecError::UnauthorizedImports(_) => "VALIDATION_ERROR",
            ExecError::SandboxViolation(_) => "SANDBOX_VIOLATION",
            ExecError::ResourceExceeded(_) => "RESOURCE_EXCEEDED",
            ExecError::RunnerFault(_) | ExecError::Io(_) => "RUNNER_FAULT",
            ExecError::Orchestration(_) | ExecError::NoRunner { .. } => "ORCHESTRATION_FAULT",
            ExecError::Transport(_) => "TRANSPORT_ERROR",
            ExecError::ExecutionNotFound(_) => "NOT_FOUND",
            ExecError::AlreadyExists(_) => "ALREADY_EXISTS",
            ExecError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
