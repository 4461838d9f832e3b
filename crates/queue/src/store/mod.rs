//! Durable queue storage.
//!
//! [`QueueStore`] is the only shared mutable resource in the queue. Every
//! state transition goes through one of its atomic operations; callers never
//! read an entry, modify it, and write it back.
//!
//! - [`InMemoryQueueStore`]: process-local, for tests and development.
//! - [`SqliteQueueStore`]: survives restarts; the production store.

pub mod in_memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use memsync_core::EntryId;

use crate::types::{EntryState, QueueCounts, QueueEntry};

pub use in_memory::InMemoryQueueStore;
pub use sqlite::SqliteQueueStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("queue entry not found: {0}")]
    NotFound(EntryId),
    /// The entry exists but is not in the state the operation requires.
    #[error("queue entry {id} is {actual}, expected {expected}")]
    Conflict {
        id: EntryId,
        expected: EntryState,
        actual: EntryState,
    },
    #[error("queue entry already exists: {0}")]
    AlreadyExists(EntryId),
    #[error("stored queue entry is corrupt: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Persistence for queue entries.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new entry.
    async fn insert(&self, entry: QueueEntry) -> StoreResult<()>;

    /// Fetch an entry by id, in any state.
    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>>;

    /// Pending entries with `next_attempt_at <= now`, oldest `created_at`
    /// first (insertion order breaks ties), at most `limit` of them.
    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueueEntry>>;

    /// Atomically claim a pending entry for sending.
    ///
    /// Fails with [`StoreError::Conflict`] unless the entry is `Pending`; this
    /// is the sole mutual-exclusion point between drain cycles.
    async fn mark_sending(&self, id: EntryId) -> StoreResult<QueueEntry>;

    /// Delete a delivered entry. The entry must be `Sending`.
    async fn mark_succeeded(&self, id: EntryId) -> StoreResult<()>;

    /// Return a `Sending` entry to `Pending`, counting the failed attempt.
    async fn mark_retry(
        &self,
        id: EntryId,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> StoreResult<QueueEntry>;

    /// Freeze a `Sending` entry, counting the failed attempt.
    async fn mark_dead_lettered(&self, id: EntryId, error: String) -> StoreResult<QueueEntry>;

    /// All dead-lettered entries, oldest first.
    async fn list_dead_lettered(&self) -> StoreResult<Vec<QueueEntry>>;

    async fn count(&self) -> StoreResult<QueueCounts>;

    /// Startup repair: reset every `Sending` entry to `Pending` eligible at `now`.
    ///
    /// Returns how many entries were recovered.
    async fn recover_in_flight(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Operator action: put a dead-lettered entry back in the queue.
    ///
    /// `attempt_count` is kept, so a further failure past the cap
    /// dead-letters it again.
    async fn requeue_dead_letter(&self, id: EntryId, now: DateTime<Utc>)
    -> StoreResult<QueueEntry>;

    /// Operator action: delete a dead-lettered entry.
    async fn purge_dead_letter(&self, id: EntryId) -> StoreResult<()>;
}

#[async_trait]
impl<S: QueueStore + ?Sized> QueueStore for Arc<S> {
    async fn insert(&self, entry: QueueEntry) -> StoreResult<()> {
        (**self).insert(entry).await
    }

    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
        (**self).get(id).await
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueueEntry>> {
        (**self).list_ready(now, limit).await
    }

    async fn mark_sending(&self, id: EntryId) -> StoreResult<QueueEntry> {
        (**self).mark_sending(id).await
    }

    async fn mark_succeeded(&self, id: EntryId) -> StoreResult<()> {
        (**self).mark_succeeded(id).await
    }

    async fn mark_retry(
        &self,
        id: EntryId,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> StoreResult<QueueEntry> {
        (**self).mark_retry(id, next_attempt_at, error).await
    }

    async fn mark_dead_lettered(&self, id: EntryId, error: String) -> StoreResult<QueueEntry> {
        (**self).mark_dead_lettered(id, error).await
    }

    async fn list_dead_lettered(&self) -> StoreResult<Vec<QueueEntry>> {
        (**self).list_dead_lettered().await
    }

    async fn count(&self) -> StoreResult<QueueCounts> {
        (**self).count().await
    }

    async fn recover_in_flight(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        (**self).recover_in_flight(now).await
    }

    async fn requeue_dead_letter(
        &self,
        id: EntryId,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        (**self).requeue_dead_letter(id, now).await
    }

    async fn purge_dead_letter(&self, id: EntryId) -> StoreResult<()> {
        (**self).purge_dead_letter(id).await
    }
}
