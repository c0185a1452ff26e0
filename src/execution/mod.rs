//! Execution lifecycle: records, the pending-item queue and the manager that
//! drains it.
//!
//! A caller creates a QUEUED [`Execution`] and enqueues an
//! [`ArtifactSnapshot`](crate::artifact::ArtifactSnapshot). The
//! [`QueueManager`] consumer then moves the record through
//! RUNNING to exactly one terminal status.

pub mod manager;
pub mod queue;
pub mod record;
pub mod store;

pub use manager::QueueManager;
pub use queue::{InMemoryQueueStore, QueueItem, QueueStore};
pub use record::{Execution, ExecutionOutcome, ExecutionStatus};
pub use store::{ExecutionStore, InMemoryExecutionStore};
