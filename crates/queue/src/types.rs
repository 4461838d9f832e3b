//! Queue entry model and the counters derived from it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use memsync_core::EntryId;

/// Free-form string metadata forwarded to the remote write untouched.
pub type Metadata = BTreeMap<String, String>;

/// Lifecycle state of a queued entry.
///
/// Succeeded entries are deleted, so there is no `Succeeded` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for `next_attempt_at` to pass.
    Pending,
    /// Claimed by the running drain cycle.
    Sending,
    /// Frozen after a terminal failure or exhausted retries.
    DeadLettered,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Sending => "sending",
            EntryState::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryState::Pending),
            "sending" => Some(EntryState::Sending),
            "dead_lettered" => Some(EntryState::DeadLettered),
            _ => None,
        }
    }
}

impl core::fmt::Display for EntryState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable queued write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    /// Opaque request body; never inspected by the queue.
    pub payload: Vec<u8>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Completed write attempts so far.
    pub attempt_count: u32,
    /// Not eligible before this instant while `Pending`.
    pub next_attempt_at: DateTime<Utc>,
    pub state: EntryState,
    pub last_error: Option<String>,
}

impl QueueEntry {
    /// Build a fresh `Pending` entry that is eligible immediately.
    pub fn new(payload: Vec<u8>, metadata: Metadata, now: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            payload,
            metadata,
            created_at: now,
            attempt_count: 0,
            next_attempt_at: now,
            state: EntryState::Pending,
            last_error: None,
        }
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    /// Whether a drain cycle running at `now` may pick this entry up.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Pending && self.next_attempt_at <= now
    }
}

/// Raw per-state counts reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub sending: usize,
    pub dead_lettered: usize,
    /// Creation time of the oldest entry not yet delivered (pending or sending).
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.sending + self.dead_lettered
    }
}

/// Observability snapshot exposed by the facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries awaiting delivery, including those currently in flight.
    pub pending_count: usize,
    /// Entries claimed by the running drain cycle.
    pub in_flight_count: usize,
    pub dead_lettered_count: usize,
    /// Age of the oldest undelivered entry.
    pub oldest_pending_age: Option<Duration>,
}

impl QueueStats {
    pub fn from_counts(counts: QueueCounts, now: DateTime<Utc>) -> Self {
        let oldest_pending_age = counts
            .oldest_pending_created_at
            .map(|created| (now - created).to_std().unwrap_or(Duration::ZERO));

        Self {
            pending_count: counts.pending + counts.sending,
            in_flight_count: counts.sending,
            dead_lettered_count: counts.dead_lettered,
            oldest_pending_age,
        }
    }

    /// True when nothing is waiting and nothing has been dead-lettered.
    pub fn is_drained(&self) -> bool {
        self.pending_count == 0 && self.dead_lettered_count == 0
    }
}
