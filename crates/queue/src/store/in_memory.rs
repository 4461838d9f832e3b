//! In-memory queue store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use memsync_core::EntryId;

use super::{QueueStore, StoreError, StoreResult};
use crate::types::{EntryState, QueueCounts, QueueEntry};

#[derive(Debug)]
struct Slot {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    entry: QueueEntry,
}

#[derive(Debug, Default)]
struct Slots {
    entries: HashMap<EntryId, Slot>,
    next_seq: u64,
}

impl Slots {
    fn sorted<'a>(&'a self, keep: impl Fn(&QueueEntry) -> bool) -> Vec<&'a Slot> {
        let mut slots: Vec<&Slot> = self.entries.values().filter(|s| keep(&s.entry)).collect();
        slots.sort_by_key(|s| (s.entry.created_at, s.seq));
        slots
    }

    /// Apply `f` to an entry currently in `expected` state.
    fn transition(
        &mut self,
        id: EntryId,
        expected: EntryState,
        f: impl FnOnce(&mut QueueEntry),
    ) -> StoreResult<QueueEntry> {
        let slot = self.entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if slot.entry.state != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: slot.entry.state,
            });
        }
        f(&mut slot.entry);
        Ok(slot.entry.clone())
    }
}

/// Process-local queue store.
///
/// Entries are lost when the process exits; use [`super::SqliteQueueStore`]
/// where durability matters.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    slots: RwLock<Slots>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Slots>> {
        self.slots
            .read()
            .map_err(|_| StoreError::Storage("in-memory queue lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Slots>> {
        self.slots
            .write()
            .map_err(|_| StoreError::Storage("in-memory queue lock poisoned".into()))
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, entry: QueueEntry) -> StoreResult<()> {
        let mut slots = self.write()?;
        if slots.entries.contains_key(&entry.id) {
            return Err(StoreError::AlreadyExists(entry.id));
        }
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.entries.insert(entry.id, Slot { seq, entry });
        Ok(())
    }

    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
        Ok(self.read()?.entries.get(&id).map(|s| s.entry.clone()))
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueueEntry>> {
        let slots = self.read()?;
        Ok(slots
            .sorted(|e| e.is_ready(now))
            .into_iter()
            .take(limit)
            .map(|s| s.entry.clone())
            .collect())
    }

    async fn mark_sending(&self, id: EntryId) -> StoreResult<QueueEntry> {
        self.write()?.transition(id, EntryState::Pending, |e| {
            e.state = EntryState::Sending;
        })
    }

    async fn mark_succeeded(&self, id: EntryId) -> StoreResult<()> {
        let mut slots = self.write()?;
        slots.transition(id, EntryState::Sending, |_| {})?;
        slots.entries.remove(&id);
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: EntryId,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> StoreResult<QueueEntry> {
        self.write()?.transition(id, EntryState::Sending, |e| {
            e.state = EntryState::Pending;
            e.attempt_count += 1;
            e.next_attempt_at = next_attempt_at;
            e.last_error = Some(error);
        })
    }

    async fn mark_dead_lettered(&self, id: EntryId, error: String) -> StoreResult<QueueEntry> {
        self.write()?.transition(id, EntryState::Sending, |e| {
            e.state = EntryState::DeadLettered;
            e.attempt_count += 1;
            e.last_error = Some(error);
        })
    }

    async fn list_dead_lettered(&self) -> StoreResult<Vec<QueueEntry>> {
        let slots = self.read()?;
        Ok(slots
            .sorted(|e| e.state == EntryState::DeadLettered)
            .into_iter()
            .map(|s| s.entry.clone())
            .collect())
    }

    async fn count(&self) -> StoreResult<QueueCounts> {
        let slots = self.read()?;
        let mut counts = QueueCounts::default();

        for slot in slots.entries.values() {
            let entry = &slot.entry;
            match entry.state {
                EntryState::Pending => counts.pending += 1,
                EntryState::Sending => counts.sending += 1,
                EntryState::DeadLettered => counts.dead_lettered += 1,
            }
            if entry.state != EntryState::DeadLettered {
                counts.oldest_pending_created_at = Some(match counts.oldest_pending_created_at {
                    Some(oldest) => oldest.min(entry.created_at),
                    None => entry.created_at,
                });
            }
        }

        Ok(counts)
    }

    async fn recover_in_flight(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut slots = self.write()?;
        let mut recovered = 0;
        for slot in slots.entries.values_mut() {
            if slot.entry.state == EntryState::Sending {
                slot.entry.state = EntryState::Pending;
                slot.entry.next_attempt_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn requeue_dead_letter(
        &self,
        id: EntryId,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        self.write()?.transition(id, EntryState::DeadLettered, |e| {
            e.state = EntryState::Pending;
            e.next_attempt_at = now;
        })
    }

    async fn purge_dead_letter(&self, id: EntryId) -> StoreResult<()> {
        let mut slots = self.write()?;
        slots.transition(id, EntryState::DeadLettered, |_| {})?;
        slots.entries.remove(&id);
        Ok(())
    }
}
