use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::artifact::ArtifactSnapshot;
use crate::config::{QueueConfig, ResourceLimits};
use crate::error::Result;
use crate::execution::queue::{QueueItem, QueueStore};
use crate::execution::record::{Execution, ExecutionOutcome};
use crate::execution::store::ExecutionStore;
use crate::orchestrator::{ExecuteRequest, OrchestratorClient, TransportError};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether this manager currently has a consumer task.
#[derive(Debug, Default)]
struct ConsumerState {
    active: AtomicBool,
}

impl ConsumerState {
    /// Claim the consumer slot. Only one caller can win until [`Self::release`].
    fn try_claim(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct Inner {
    queue: Arc<dyn QueueStore>,
    store: Arc<dyn ExecutionStore>,
    client: Arc<dyn OrchestratorClient>,
    default_limits: ResourceLimits,
    transport_grace: Duration,
    consumer: ConsumerState,
    idle: Notify,
}

/// FIFO producer/consumer over a [`QueueStore`].
///
/// `enqueue` only appends and makes sure a consumer task exists. The consumer
/// pops one item at a time, marks it RUNNING, calls the orchestrator and
/// writes the terminal status. It exits when the queue is empty and the next
/// enqueue starts a new one.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        store: Arc<dyn ExecutionStore>,
        client: Arc<dyn OrchestratorClient>,
        config: &QueueConfig,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                store,
                client,
                default_limits,
                transport_grace: config.transport_grace(),
                consumer: ConsumerState::default(),
                idle: Notify::new(),
            }),
        }
    }

    /// Append to the queue and return without waiting for execution.
    ///
    /// The execution record must already exist in the store as QUEUED.
    pub async fn enqueue(
        &self,
        execution_id: Uuid,
        artifact: ArtifactSnapshot,
        input: Option<Value>,
    ) {
        self.inner
            .queue
            .push_back(QueueItem::new(execution_id, artifact, input))
            .await;
        tracing::info!(execution_id = %execution_id, "Execution enqueued");
        self.ensure_consumer();
    }

    /// Create a QUEUED record for `artifact` and enqueue it.
    pub async fn submit(
        &self,
        artifact: ArtifactSnapshot,
        input: Option<Value>,
        user_id: Option<String>,
    ) -> Result<Execution> {
        let execution = Execution::new(input.clone()).owned_by(artifact.id.clone(), user_id);
        self.inner.store.insert(execution.clone()).await?;
        self.enqueue(execution.id, artifact, input).await;
        Ok(execution)
    }

    /// QUEUED -> CANCELLED. The queue item stays put and is skipped when it
    /// reaches the head.
    pub async fn cancel(&self, execution_id: &Uuid) -> Result<Execution> {
        let execution = self.inner.store.cancel(execution_id).await?;
        tracing::info!(execution_id = %execution_id, "Execution cancelled");
        Ok(execution)
    }

    pub fn is_processing(&self) -> bool {
        self.inner.consumer.is_active()
    }

    /// Items waiting in the queue, cancelled ones included.
    pub async fn pending(&self) -> usize {
        self.inner.queue.len().await
    }

    /// Resolve once the queue is empty and no consumer is running.
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if !self.is_processing() && self.inner.queue.is_empty().await {
                return;
            }
            tokio::select! {
                _ = idle => {}
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }

    fn ensure_consumer(&self) {
        if self.inner.consumer.try_claim() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.consume().await;
            });
        }
    }
}

impl Inner {
    async fn consume(self: Arc<Self>) {
        tracing::debug!("Queue consumer started");
        loop {
            while let Some(item) = self.queue.pop_front().await {
                self.clone().process_guarded(item).await;
            }

            self.consumer.release();
            self.idle.notify_waiters();

            // An enqueue that landed between the last empty pop and the
            // release saw an active consumer and did not spawn one.
            if self.queue.is_empty().await || !self.consumer.try_claim() {
                break;
            }
        }
        tracing::debug!("Queue consumer stopped");
    }

    /// Run one item in its own task so a panic is contained to that item.
    async fn process_guarded(self: Arc<Self>, item: QueueItem) {
        let execution_id = item.execution_id;
        let worker = self.clone();
        let task = tokio::spawn(async move { worker.process(item).await });

        if let Err(e) = task.await {
            tracing::error!(execution_id = %execution_id, error = %e, "Queue item processing panicked");
            let outcome = ExecutionOutcome::failed(format!("Execution processing failed: {}", e));
            // A panic before dequeue bookkeeping leaves the record QUEUED, which
            // can only reach FAILED through RUNNING.
            if let Err(e) = self.store.mark_running(&execution_id).await {
                tracing::debug!(execution_id = %execution_id, error = %e, "Record not moved to running");
            }
            if let Err(e) = self.store.finish(&execution_id, outcome).await {
                tracing::warn!(execution_id = %execution_id, error = %e, "Could not record processing failure");
            }
        }
    }

    async fn process(&self, item: QueueItem) {
        let execution_id = item.execution_id;

        match self.store.mark_running(&execution_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(execution_id = %execution_id, "Execution no longer queued, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Could not mark execution running");
                return;
            }
        }

        let limits = item.artifact.limits(&self.default_limits);
        let timeout = limits.execution_timeout() + self.transport_grace;
        let waited = chrono::Utc::now() - item.queued_at;
        tracing::info!(
            execution_id = %execution_id,
            queued_ms = waited.num_milliseconds(),
            timeout_ms = timeout.as_millis() as u64,
            "Execution dequeued"
        );

        let request = ExecuteRequest {
            execution_id,
            artifact: item.artifact,
            input: item.input,
        };
        let response = tokio::time::timeout(timeout, self.client.execute(&request, timeout))
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)));

        let outcome = match response {
            Ok(result) => ExecutionOutcome::from_result(result),
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Orchestrator call failed");
                ExecutionOutcome::from_transport(&e)
            }
        };

        match self.store.finish(&execution_id, outcome).await {
            Ok(execution) => {
                tracing::info!(
                    execution_id = %execution_id,
                    status = %execution.status,
                    "Execution finished"
                );
            }
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Could not record execution result");
            }
        }
    }
}
