use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::artifact::ArtifactSnapshot;

/// One pending execution. Dropped as soon as it is dequeued.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub execution_id: Uuid,
    pub artifact: ArtifactSnapshot,
    pub input: Option<serde_json::Value>,
    pub queued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(
        execution_id: Uuid,
        artifact: ArtifactSnapshot,
        input: Option<serde_json::Value>,
    ) -> Self {
        Self {
            execution_id,
            artifact,
            input,
            queued_at: Utc::now(),
        }
    }
}

/// FIFO backing the queue manager. `pop_front` must be a single atomic step.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push_back(&self, item: QueueItem);

    async fn pop_front(&self) -> Option<QueueItem>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    items: Mutex<VecDeque<QueueItem>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push_back(&self, item: QueueItem) {
        self.items.lock().await.push_back(item);
    }

    async fn pop_front(&self) -> Option<QueueItem> {
        self.items.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}
