//! Shared helpers for the integration tests.
//!
//! Provides polling helpers, a scripted orchestrator transport and a queue
//! manager wired to in-memory stores.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use artifact_runner::artifact::ArtifactSnapshot;
use artifact_runner::config::{QueueConfig, ResourceLimits};
use artifact_runner::execution::{
    Execution, ExecutionStatus, ExecutionStore, InMemoryExecutionStore, InMemoryQueueStore,
    QueueManager,
};
use artifact_runner::orchestrator::{
    ExecuteRequest, ExecutionResult, OrchestratorClient, ResultStatus, TransportError,
};
use artifact_runner::runner::ResourceUsage;

/// Orchestrator stand-in whose reply is picked by the artifact content:
///
/// - `ok:<text>` succeeds with `<text>` as output
/// - `fail:<text>` returns an error-status result
/// - `timeout`, `aborted`, `refused` fail the transport accordingly
/// - `hold` blocks until [`ScriptedOrchestrator::release`] is called
/// - `panic` panics inside the call
pub struct ScriptedOrchestrator {
    calls: Mutex<Vec<Uuid>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gate: Semaphore,
    delay: Duration,
}

impl ScriptedOrchestrator {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(10))
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            delay,
        }
    }

    /// Execution IDs in the order the orchestrator was called.
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Let one `hold` call return.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    async fn reply(&self, request: &ExecuteRequest) -> Result<ExecutionResult, TransportError> {
        tokio::time::sleep(self.delay).await;

        let content = request.artifact.content.as_str();
        let (verb, text) = content.split_once(':').unwrap_or((content, ""));
        match verb {
            "ok" => Ok(result(request.execution_id, ResultStatus::Success, text)),
            "fail" => Ok(result(request.execution_id, ResultStatus::Error, text)),
            "timeout" => Err(TransportError::Timeout(Duration::from_millis(50))),
            "aborted" => Err(TransportError::ConnectionAborted("socket hang up".to_string())),
            "refused" => Err(TransportError::Connection("connection refused".to_string())),
            "hold" => {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                Ok(result(request.execution_id, ResultStatus::Success, "released"))
            }
            "panic" => panic!("scripted orchestrator panic"),
            other => Ok(result(
                request.execution_id,
                ResultStatus::Error,
                &format!("unknown script {}", other),
            )),
        }
    }
}

#[async_trait]
impl OrchestratorClient for ScriptedOrchestrator {
    async fn execute(
        &self,
        request: &ExecuteRequest,
        _timeout: Duration,
    ) -> Result<ExecutionResult, TransportError> {
        self.calls.lock().unwrap().push(request.execution_id);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let reply = self.reply(request).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

fn result(execution_id: Uuid, status: ResultStatus, text: &str) -> ExecutionResult {
    let success = status == ResultStatus::Success;
    ExecutionResult {
        execution_id,
        status,
        output: success.then(|| text.to_string()),
        error: (!success).then(|| text.to_string()),
        exit_code: Some(if success { 0 } else { 1 }),
        stdout: if success { text.to_string() } else { String::new() },
        stderr: if success { String::new() } else { text.to_string() },
        duration: 1,
        resource_usage: ResourceUsage {
            cpu_time: 1,
            memory: 0,
        },
        warnings: Vec::new(),
    }
}

/// A queue manager over fresh in-memory stores.
pub struct TestQueue {
    pub store: Arc<InMemoryExecutionStore>,
    pub manager: QueueManager,
}

impl TestQueue {
    pub fn new(client: Arc<dyn OrchestratorClient>) -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        let manager = QueueManager::new(
            Arc::new(InMemoryQueueStore::new()),
            store.clone(),
            client,
            &QueueConfig::default(),
            ResourceLimits::default(),
        );
        Self { store, manager }
    }

    /// Create the record and enqueue a scripted artifact.
    pub async fn submit(&self, script: &str) -> Uuid {
        self.manager
            .submit(script_artifact(script), None, None)
            .await
            .unwrap()
            .id
    }

    pub async fn execution(&self, id: &Uuid) -> Execution {
        self.store.get(id).await.unwrap()
    }

    pub async fn status(&self, id: &Uuid) -> ExecutionStatus {
        self.execution(id).await.status
    }

    pub async fn drain(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.manager.drain())
            .await
            .expect("queue did not drain");
    }
}

pub fn script_artifact(script: &str) -> ArtifactSnapshot {
    ArtifactSnapshot::new("javascript-snippet", "javascript", script)
}

/// Poll `condition` until it holds or `timeout_duration` elapses.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
