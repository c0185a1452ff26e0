//! Queue manager behaviour: ordering, the single consumer, status
//! transitions and fault containment.

mod test_harness;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use artifact_runner::artifact::ArtifactSnapshot;
use artifact_runner::config::{QueueConfig, ResourceLimits, RunnerConfig};
use artifact_runner::error::Result;
use artifact_runner::execution::{
    Execution, ExecutionOutcome, ExecutionStatus, ExecutionStore, InMemoryExecutionStore,
    InMemoryQueueStore, QueueManager,
};
use artifact_runner::orchestrator::{LocalOrchestratorClient, Orchestrator};
use test_harness::{assert_eventually, script_artifact, ScriptedOrchestrator, TestQueue};

#[tokio::test]
async fn test_items_are_processed_in_fifo_order() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(queue.submit(&format!("ok:{}", i)).await);
    }
    queue.drain().await;

    assert_eq!(orchestrator.calls(), ids);
    for (i, id) in ids.iter().enumerate() {
        let execution = queue.execution(id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, Some(i.to_string()));
    }
}

#[tokio::test]
async fn test_concurrent_enqueues_share_one_consumer() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let mut handles = Vec::new();
    for i in 0..10 {
        let manager = queue.manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .submit(script_artifact(&format!("ok:{}", i)), None, None)
                .await
                .unwrap()
                .id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    queue.drain().await;

    assert_eq!(orchestrator.calls().len(), 10);
    assert_eq!(orchestrator.max_concurrency(), 1);
    for id in &ids {
        assert_eq!(queue.status(id).await, ExecutionStatus::Completed);
    }
}

#[tokio::test]
async fn test_second_item_waits_while_first_is_running() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let a = queue.submit("hold").await;
    let b = queue.submit("ok:b").await;

    let q = &queue;
    assert_eventually(
        move || async move { q.status(&a).await == ExecutionStatus::Running },
        Duration::from_secs(5),
        "first execution never started",
    )
    .await;

    // Give the consumer room to misbehave before checking B.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.status(&a).await, ExecutionStatus::Running);
    assert_eq!(queue.status(&b).await, ExecutionStatus::Queued);
    assert!(queue.manager.is_processing());
    assert_eq!(queue.manager.pending().await, 1);

    orchestrator.release();
    queue.drain().await;

    let first = queue.execution(&a).await;
    let second = queue.execution(&b).await;
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
}

#[tokio::test]
async fn test_result_and_transport_failures_map_to_statuses() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let failed = queue.submit("fail:NameError: x is not defined").await;
    let timed_out = queue.submit("timeout").await;
    let aborted = queue.submit("aborted").await;
    let refused = queue.submit("refused").await;
    queue.drain().await;

    let execution = queue.execution(&failed).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("NameError: x is not defined"));
    assert_eq!(execution.exit_code, Some(1));

    let execution = queue.execution(&timed_out).await;
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(execution.error.unwrap().contains("timed out"));

    assert_eq!(queue.status(&aborted).await, ExecutionStatus::Timeout);

    let execution = queue.execution(&refused).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().contains("connection refused"));
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn test_panic_in_processing_fails_item_and_loop_continues() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let bad = queue.submit("panic").await;
    let good = queue.submit("ok:still here").await;
    queue.drain().await;

    let execution = queue.execution(&bad).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().contains("panic"));

    let execution = queue.execution(&good).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output.as_deref(), Some("still here"));
}

/// Store whose first `mark_running` call panics.
struct PanicOnFirstStart {
    inner: InMemoryExecutionStore,
    tripped: AtomicBool,
}

#[async_trait]
impl ExecutionStore for PanicOnFirstStart {
    async fn insert(&self, execution: Execution) -> Result<()> {
        self.inner.insert(execution).await
    }

    async fn get(&self, id: &Uuid) -> Option<Execution> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Vec<Execution> {
        self.inner.list().await
    }

    async fn mark_running(&self, id: &Uuid) -> Result<bool> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("store unavailable");
        }
        self.inner.mark_running(id).await
    }

    async fn finish(&self, id: &Uuid, outcome: ExecutionOutcome) -> Result<Execution> {
        self.inner.finish(id, outcome).await
    }

    async fn cancel(&self, id: &Uuid) -> Result<Execution> {
        self.inner.cancel(id).await
    }

    async fn reconcile_stale(&self) -> Vec<Uuid> {
        self.inner.reconcile_stale().await
    }
}

#[tokio::test]
async fn test_panic_before_start_does_not_strand_queued_record() {
    let store = Arc::new(PanicOnFirstStart {
        inner: InMemoryExecutionStore::new(),
        tripped: AtomicBool::new(false),
    });
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let manager = QueueManager::new(
        Arc::new(InMemoryQueueStore::new()),
        store.clone(),
        orchestrator.clone(),
        &QueueConfig::default(),
        ResourceLimits::default(),
    );

    let first = manager
        .submit(script_artifact("ok:never"), None, None)
        .await
        .unwrap();
    let second = manager
        .submit(script_artifact("ok:second"), None, None)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), manager.drain())
        .await
        .unwrap();

    let stranded = store.get(&first.id).await.unwrap();
    assert_eq!(stranded.status, ExecutionStatus::Failed);
    assert!(stranded
        .error
        .unwrap()
        .contains("Execution processing failed"));
    assert!(stranded.completed_at.is_some());

    assert_eq!(
        store.get(&second.id).await.unwrap().status,
        ExecutionStatus::Completed
    );
    assert_eq!(orchestrator.calls(), vec![second.id]);
}

#[tokio::test]
async fn test_cancelled_item_is_skipped() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let a = queue.submit("hold").await;
    let b = queue.submit("ok:b").await;
    let q = &queue;
    assert_eventually(
        move || async move { q.status(&a).await == ExecutionStatus::Running },
        Duration::from_secs(5),
        "first execution never started",
    )
    .await;

    let cancelled = queue.manager.cancel(&b).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let err = queue.manager.cancel(&a).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    orchestrator.release();
    queue.drain().await;

    assert_eq!(queue.status(&a).await, ExecutionStatus::Completed);
    assert_eq!(queue.status(&b).await, ExecutionStatus::Cancelled);
    assert_eq!(orchestrator.calls(), vec![a]);
}

#[tokio::test]
async fn test_terminal_status_is_final() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator);

    let id = queue.submit("ok:done").await;
    queue.drain().await;
    let before = queue.execution(&id).await;
    assert_eq!(before.status, ExecutionStatus::Completed);

    assert!(queue
        .store
        .finish(&id, ExecutionOutcome::failed("late write"))
        .await
        .is_err());
    assert!(queue.manager.cancel(&id).await.is_err());
    assert_eq!(queue.execution(&id).await, before);
}

#[tokio::test]
async fn test_consumer_restarts_after_going_idle() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    let first = queue.submit("ok:1").await;
    queue.drain().await;
    assert!(!queue.manager.is_processing());
    assert_eq!(queue.manager.pending().await, 0);

    let second = queue.submit("ok:2").await;
    queue.drain().await;

    assert_eq!(queue.status(&first).await, ExecutionStatus::Completed);
    assert_eq!(queue.status(&second).await, ExecutionStatus::Completed);
    assert_eq!(orchestrator.calls(), vec![first, second]);
}

#[tokio::test]
async fn test_item_without_record_is_dropped() {
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let queue = TestQueue::new(orchestrator.clone());

    queue
        .manager
        .enqueue(Uuid::new_v4(), script_artifact("ok:orphan"), None)
        .await;
    queue.drain().await;

    assert!(orchestrator.calls().is_empty());
    assert!(queue.store.list().await.is_empty());
}

#[tokio::test]
async fn test_end_to_end_with_in_process_orchestrator() {
    let orchestrator = Arc::new(Orchestrator::from_config(
        &RunnerConfig::default(),
        ResourceLimits::default(),
    ));
    let queue = TestQueue::new(Arc::new(LocalOrchestratorClient::new(orchestrator)));

    let js = queue
        .manager
        .submit(
            ArtifactSnapshot::new("javascript-snippet", "javascript", "console.log(1 + 1)"),
            None,
            Some("user-1".to_string()),
        )
        .await
        .unwrap();
    let html = queue
        .manager
        .submit(
            ArtifactSnapshot::new("html-page", "html", "<script>alert(1)</script>"),
            None,
            None,
        )
        .await
        .unwrap();
    queue.drain().await;

    let execution = queue.execution(&js.id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.stdout.as_deref(), Some("2"));
    assert_eq!(execution.exit_code, Some(0));
    assert_eq!(execution.user_id.as_deref(), Some("user-1"));

    let execution = queue.execution(&html.id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(!execution.warnings.is_empty());
}
