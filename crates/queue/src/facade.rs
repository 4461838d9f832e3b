//! Public entry point: enqueue writes and inspect the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;

use memsync_core::{EntryId, SharedClock, SystemClock};

use crate::config::{ConfigError, QueueConfig};
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::processor::{DrainOutcome, ProcessorStats, QueueProcessor};
use crate::remote::RemoteWriter;
use crate::store::{QueueStore, SqliteQueueStore, StoreError};
use crate::types::{Metadata, QueueEntry, QueueStats};
use crate::worker::{QueueWorker, WorkerHandle};

/// Errors surfaced to callers of [`WriteQueue`].
///
/// Remote write failures never appear here; they end up as retries or
/// dead-lettered entries.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid queue configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Builder for [`WriteQueue`].
pub struct WriteQueueBuilder {
    store: Arc<dyn QueueStore>,
    writer: Arc<dyn RemoteWriter>,
    config: QueueConfig,
    clock: SharedClock,
    connectivity: Option<ConnectivityMonitor>,
}

impl WriteQueueBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn build(self) -> Result<WriteQueue, QueueError> {
        let mut processor =
            QueueProcessor::from_config(Arc::clone(&self.store), self.writer, &self.config)?
                .with_clock(Arc::clone(&self.clock));
        if let Some(monitor) = self.connectivity {
            processor = processor.with_connectivity(monitor);
        }

        Ok(WriteQueue {
            processor: Arc::new(processor),
            store: self.store,
            clock: self.clock,
            tick_interval: self.config.tick_interval(),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }
}

/// Durable offline write queue.
///
/// Construct one per remote store and pass it to whoever produces writes.
/// `enqueue` only touches the local store; delivery happens in the background
/// once [`start`](Self::start) has been called.
pub struct WriteQueue {
    processor: Arc<QueueProcessor>,
    store: Arc<dyn QueueStore>,
    clock: SharedClock,
    tick_interval: Duration,
    started: AtomicBool,
    worker: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("processor", &self.processor)
            .field("tick_interval", &self.tick_interval)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WriteQueue {
    pub fn builder(
        store: Arc<dyn QueueStore>,
        writer: Arc<dyn RemoteWriter>,
    ) -> WriteQueueBuilder {
        WriteQueueBuilder {
            store,
            writer,
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
            connectivity: None,
        }
    }

    /// Open the SQLite-backed queue described by `config`.
    ///
    /// The connectivity monitor is built from `initial` and the configured
    /// debounce; report state changes through [`connectivity`](Self::connectivity).
    pub async fn open(
        config: QueueConfig,
        writer: Arc<dyn RemoteWriter>,
        initial: ConnectivityState,
    ) -> anyhow::Result<Self> {
        let path = match &config.database_path {
            Some(path) => path.clone(),
            None => SqliteQueueStore::default_path()?,
        };
        let store = SqliteQueueStore::open(&path)
            .await
            .with_context(|| format!("failed to open queue database at {}", path.display()))?;

        let connectivity = ConnectivityMonitor::new(initial, config.connectivity_debounce());
        let queue = Self::builder(Arc::new(store), writer)
            .config(config)
            .connectivity(connectivity)
            .build()
            .context("failed to build write queue")?;
        Ok(queue)
    }

    /// Run startup recovery and begin background draining.
    ///
    /// Entries left `Sending` by a previous process become eligible again.
    /// Returns how many were recovered. Calling this twice is a no-op.
    pub async fn start(&self) -> Result<usize, QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("write queue already started");
            return Ok(0);
        }

        let recovered = match self.processor.recover_in_flight().await {
            Ok(n) => n,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        // The worker's first tick fires immediately and performs the initial drain.
        let handle = QueueWorker::new(Arc::clone(&self.processor), self.tick_interval).spawn();
        *self.worker_slot() = Some(handle);
        tracing::info!("write queue started");
        Ok(recovered)
    }

    /// Stop background draining and wait for the worker to exit.
    pub async fn shutdown(&self) {
        let handle = self.worker_slot().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Persist a write for delivery and return its id.
    ///
    /// Fails only if the local store rejects the insert.
    pub async fn enqueue(
        &self,
        payload: impl Into<Vec<u8>>,
        metadata: Metadata,
    ) -> Result<EntryId, QueueError> {
        let entry = QueueEntry::new(payload.into(), metadata, self.clock.now());
        let id = entry.id;
        let size = entry.payload.len();
        self.store.insert(entry).await?;
        tracing::debug!(entry_id = %id, bytes = size, "entry enqueued");
        self.wake();
        Ok(id)
    }

    /// Serialize `value` as JSON and enqueue it.
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        metadata: Metadata,
    ) -> Result<EntryId, QueueError> {
        let payload = serde_json::to_vec(value)?;
        self.enqueue(payload, metadata).await
    }

    /// Schedule a drain without waiting for it.
    ///
    /// Goes through the worker once started, otherwise spawns a drain task.
    pub fn wake(&self) {
        if let Some(worker) = self.worker_slot().as_ref() {
            worker.wake();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let processor = Arc::clone(&self.processor);
                runtime.spawn(async move {
                    processor.drain().await;
                });
            }
            Err(_) => tracing::debug!("no tokio runtime; drain deferred to the next wake"),
        }
    }

    /// Drain now and wait for the result.
    pub async fn drain_now(&self) -> DrainOutcome {
        self.processor.drain().await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.store.count().await?;
        Ok(QueueStats::from_counts(counts, self.clock.now()))
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.store.list_dead_lettered().await?)
    }

    /// Put a dead-lettered entry back in line and wake the processor.
    pub async fn requeue_dead_letter(&self, id: EntryId) -> Result<QueueEntry, QueueError> {
        let entry = self.store.requeue_dead_letter(id, self.clock.now()).await?;
        tracing::info!(entry_id = %id, attempts = entry.attempt_count, "dead letter requeued");
        self.wake();
        Ok(entry)
    }

    pub async fn purge_dead_letter(&self, id: EntryId) -> Result<(), QueueError> {
        self.store.purge_dead_letter(id).await?;
        tracing::info!(entry_id = %id, "dead letter purged");
        Ok(())
    }

    pub fn connectivity(&self) -> Option<&ConnectivityMonitor> {
        self.processor.connectivity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{WriteFailure, WriteRequest};
    use crate::store::InMemoryQueueStore;
    use crate::types::EntryState;
    use async_trait::async_trait;

    struct Rejects(u16);

    #[async_trait]
    impl RemoteWriter for Rejects {
        async fn write(&self, _request: &WriteRequest) -> Result<(), WriteFailure> {
            Err(WriteFailure::client_error(self.0, "rejected"))
        }
    }

    fn queue(writer: Arc<dyn RemoteWriter>) -> WriteQueue {
        WriteQueue::builder(Arc::new(InMemoryQueueStore::new()), writer)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_json_stores_serialized_payload() {
        let queue = queue(Arc::new(Rejects(400)));
        let mut metadata = Metadata::new();
        metadata.insert("idempotency_key".into(), "k-1".into());

        let id = queue
            .enqueue_json(&serde_json::json!({"memory": "likes tea"}), metadata)
            .await
            .unwrap();

        let entry = queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.payload, br#"{"memory":"likes tea"}"#.to_vec());
        assert_eq!(entry.metadata["idempotency_key"], "k-1");
    }

    #[tokio::test]
    async fn dead_letters_can_be_requeued_and_purged() {
        let queue = queue(Arc::new(Rejects(403)));
        let id = queue.enqueue(b"x".to_vec(), Metadata::new()).await.unwrap();
        queue.drain_now().await;

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);

        let requeued = queue.requeue_dead_letter(id).await.unwrap();
        assert_eq!(requeued.state, EntryState::Pending);
        assert_eq!(requeued.attempt_count, 1);

        queue.drain_now().await;
        let entry = queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::DeadLettered);
        assert_eq!(entry.attempt_count, 2);

        queue.purge_dead_letter(id).await.unwrap();
        assert!(queue.stats().await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn purging_a_pending_entry_is_rejected() {
        let queue = queue(Arc::new(Rejects(403)));
        let id = queue.enqueue(b"x".to_vec(), Metadata::new()).await.unwrap();

        let err = queue.purge_dead_letter(id).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(e) if e.is_conflict()));
    }

    #[tokio::test]
    async fn invalid_config_fails_build() {
        let result = WriteQueue::builder(
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(Rejects(400)),
        )
        .config(QueueConfig::default().with_batch_size(0))
        .build();
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[tokio::test]
    async fn open_builds_the_monitor_from_configured_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::default()
            .with_database_path(dir.path().join("queue.db"))
            .with_connectivity_debounce(Duration::from_millis(750));

        let queue = WriteQueue::open(config, Arc::new(Rejects(400)), ConnectivityState::Offline)
            .await
            .unwrap();

        let monitor = queue.connectivity().unwrap();
        assert_eq!(monitor.debounce(), Duration::from_millis(750));
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_waits_for_a_running_drain_before_recovering() {
        struct Slow(std::sync::Mutex<Vec<u32>>);

        #[async_trait]
        impl RemoteWriter for Slow {
            async fn write(&self, request: &WriteRequest) -> Result<(), WriteFailure> {
                self.0.lock().unwrap().push(request.attempt);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        }

        let writer = Arc::new(Slow(std::sync::Mutex::new(Vec::new())));
        let queue = queue(writer.clone());
        let id = queue.enqueue(b"x".to_vec(), Metadata::new()).await.unwrap();

        // The drain spawned by enqueue is mid-write when start runs.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get(id).await.unwrap().unwrap().state, EntryState::Sending);
        assert_eq!(queue.start().await.unwrap(), 0);

        assert!(queue.get(id).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*writer.0.lock().unwrap(), vec![1]);
        let stats = queue.processor_stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.store_errors, 0);
        assert_eq!(stats.recovered, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let queue = queue(Arc::new(Rejects(400)));
        assert_eq!(queue.start().await.unwrap(), 0);
        assert_eq!(queue.start().await.unwrap(), 0);
        queue.shutdown().await;
    }
}
