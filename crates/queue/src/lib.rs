//! Durable offline write queue for a remote memory store.
//!
//! Writes are persisted locally on [`WriteQueue::enqueue`] and delivered in
//! the background once connectivity allows:
//!
//! - `connectivity`: debounced online/offline tracking with online events.
//! - `backoff` / `classifier`: retry schedule and failure classification.
//! - `store`: the durable queue (in-memory and SQLite).
//! - `processor`: single-flight drain cycles.
//! - `worker`: the background task driving the processor.
//! - `facade`: [`WriteQueue`], the entry point callers hold on to.

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod connectivity;
pub mod facade;
pub mod processor;
pub mod remote;
pub mod store;
pub mod types;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use classifier::{Classification, ErrorClassifier};
pub use config::{BackoffConfig, ConfigError, QueueConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, OnlineEvent, OnlineSubscription};
pub use facade::{QueueError, WriteQueue, WriteQueueBuilder};
pub use processor::{DrainOutcome, DrainReport, ProcessorStats, QueueProcessor};
pub use remote::{FailureKind, RemoteWriter, WriteFailure, WriteRequest};
pub use store::{InMemoryQueueStore, QueueStore, SqliteQueueStore, StoreError, StoreResult};
pub use types::{EntryState, Metadata, QueueCounts, QueueEntry, QueueStats};
pub use worker::{QueueWorker, WorkerHandle};

pub use memsync_core::{Clock, EntryId, ManualClock, SharedClock, SystemClock};
