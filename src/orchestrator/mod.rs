//! Dispatch layer between the queue and the runners.
//!
//! The [`Orchestrator`] owns a registry of runners keyed by [`RunnerKind`],
//! built once at startup. For each request it picks a runner (by artifact
//! type, then by language), resolves the effective resource limits, times the
//! run and flattens whatever the runner produced into one [`ExecutionResult`].
//!
//! Nothing escapes [`Orchestrator::execute`] as an error: a missing runner or
//! a runner that panics both become `status: "error"` results.

pub mod client;
pub mod server;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::ArtifactSnapshot;
use crate::config::{ResourceLimits, RunnerConfig};
use crate::error::ExecError;
use crate::runner::{
    HtmlRunner, JavaScriptRunner, PythonRunner, ReactRunner, ResourceUsage, Runner, RunnerInput,
    RunnerKind, RunnerResult,
};

pub use client::{HttpOrchestratorClient, LocalOrchestratorClient, OrchestratorClient, TransportError};

/// Body of `POST /execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub execution_id: Uuid,
    pub artifact: ArtifactSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Runner output normalized into the API contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ResultStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock milliseconds measured around the runner call
    pub duration: u64,
    pub resource_usage: ResourceUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    pub fn from_runner(execution_id: Uuid, result: RunnerResult, duration: u64) -> Self {
        Self {
            execution_id,
            status: if result.success {
                ResultStatus::Success
            } else {
                ResultStatus::Error
            },
            output: result.output,
            error: result.error,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            duration,
            resource_usage: result.resource_usage.unwrap_or(ResourceUsage {
                cpu_time: duration,
                memory: 0,
            }),
            warnings: result.warnings,
        }
    }

    pub fn from_error(execution_id: Uuid, err: &ExecError, duration: u64) -> Self {
        Self::from_runner(execution_id, RunnerResult::from_error(err), duration)
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Selects a runner for each request and normalizes its result.
pub struct Orchestrator {
    runners: HashMap<RunnerKind, Arc<dyn Runner>>,
    default_limits: ResourceLimits,
}

impl Orchestrator {
    /// An orchestrator with an empty registry; add runners with [`Self::with_runner`].
    pub fn new(default_limits: ResourceLimits) -> Self {
        Self {
            runners: HashMap::new(),
            default_limits,
        }
    }

    /// An orchestrator with every runner registered.
    pub fn from_config(config: &RunnerConfig, default_limits: ResourceLimits) -> Self {
        Self::new(default_limits)
            .with_runner(Arc::new(PythonRunner::new(config)))
            .with_runner(Arc::new(JavaScriptRunner::new(config)))
            .with_runner(Arc::new(JavaScriptRunner::typescript(config)))
            .with_runner(Arc::new(HtmlRunner::new()))
            .with_runner(Arc::new(ReactRunner::new()))
    }

    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runners.insert(runner.kind(), runner);
        self
    }

    pub fn default_limits(&self) -> &ResourceLimits {
        &self.default_limits
    }

    /// Registered runner kinds, in a stable order.
    pub fn runner_kinds(&self) -> Vec<RunnerKind> {
        RunnerKind::ALL
            .into_iter()
            .filter(|k| self.runners.contains_key(k))
            .collect()
    }

    /// Runner for `artifact`: exact type match first, then language.
    pub fn resolve(&self, artifact: &ArtifactSnapshot) -> Option<(RunnerKind, Arc<dyn Runner>)> {
        let by_type = RunnerKind::from_artifact_type(&artifact.artifact_type)
            .and_then(|k| self.runners.get(&k).map(|r| (k, r.clone())));
        by_type.or_else(|| {
            RunnerKind::from_language(&artifact.language)
                .and_then(|k| self.runners.get(&k).map(|r| (k, r.clone())))
        })
    }

    /// Run one artifact and return the normalized result.
    pub async fn execute(
        &self,
        execution_id: Uuid,
        artifact: &ArtifactSnapshot,
        input: Option<&serde_json::Value>,
    ) -> ExecutionResult {
        let started = Instant::now();

        let Some((kind, runner)) = self.resolve(artifact) else {
            let err = ExecError::NoRunner {
                artifact_type: artifact.artifact_type.clone(),
                language: artifact.language.clone(),
            };
            tracing::warn!(execution_id = %execution_id, error = %err, "No runner available");
            return ExecutionResult::from_error(execution_id, &err, elapsed_ms(started));
        };

        let limits = artifact.limits(&self.default_limits);
        tracing::info!(
            execution_id = %execution_id,
            runner = %kind,
            timeout_ms = limits.max_execution_time_ms,
            "Dispatching execution"
        );

        let content = artifact.content.clone();
        let input = input.cloned();
        // Spawned so that a panicking runner surfaces as a JoinError here.
        let outcome = tokio::spawn(async move {
            let input = input.as_ref().map(RunnerInput::new);
            runner.execute(&content, input, &limits).await
        })
        .await;

        let duration = elapsed_ms(started);
        match outcome {
            Ok(result) => {
                let result = ExecutionResult::from_runner(execution_id, result, duration);
                tracing::info!(
                    execution_id = %execution_id,
                    runner = %kind,
                    success = result.is_success(),
                    duration_ms = duration,
                    "Execution finished"
                );
                result
            }
            Err(e) => {
                let err = ExecError::Orchestration(format!("{} runner failed: {}", kind, e));
                tracing::error!(execution_id = %execution_id, error = %err, "Runner fault");
                ExecutionResult::from_error(execution_id, &err, duration)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
