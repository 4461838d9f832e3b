//! SQLite-backed queue store.
//!
//! Entries live in a single `queue_entries` table. Every transition is a
//! single conditional `UPDATE`/`DELETE` keyed on the expected state, so two
//! callers can never both move the same entry out of a given state.
//! Timestamps are stored as fixed-width RFC 3339 text so that string order
//! matches time order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use memsync_core::EntryId;

use super::{QueueStore, StoreError, StoreResult};
use crate::types::{EntryState, Metadata, QueueCounts, QueueEntry};

macro_rules! entry_columns {
    () => {
        "id, payload, metadata, state, attempt_count, created_at, next_attempt_at, last_error"
    };
}

/// SQLite-backed durable queue store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    /// Open (or create) the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create queue directory at {:?}", parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to create SQLite pool for queue at {:?}", path))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_entries (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                payload         BLOB NOT NULL,
                metadata        TEXT NOT NULL,
                state           TEXT NOT NULL,
                attempt_count   INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                next_attempt_at TEXT NOT NULL,
                last_error      TEXT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create queue_entries table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_entries_ready
                ON queue_entries (state, next_attempt_at)
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create queue_entries index")?;

        Ok(Self { pool })
    }

    /// Close the pool, waiting for in-use connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Default on-disk location: `{app_data_dir}/memsync/queue.db`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let mut dir = dirs::data_dir()
            .or_else(|| {
                dirs::home_dir().map(|mut h| {
                    h.push(".local");
                    h.push("share");
                    h
                })
            })
            .context(
                "failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share",
            )?;

        dir.push("memsync");
        dir.push("queue.db");
        Ok(dir)
    }

    /// Distinguish "missing" from "wrong state" after a guarded statement
    /// touched no rows.
    async fn conflict_or_missing(&self, id: EntryId, expected: EntryState) -> StoreError {
        let lookup = sqlx::query("SELECT state FROM queue_entries WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await;

        match lookup {
            Ok(None) => StoreError::NotFound(id),
            Ok(Some(row)) => match row.try_get::<String, _>("state") {
                Ok(state) => match EntryState::parse(&state) {
                    Some(actual) => StoreError::Conflict {
                        id,
                        expected,
                        actual,
                    },
                    None => StoreError::Corrupt(format!("unknown state '{state}' for {id}")),
                },
                Err(err) => err.into(),
            },
            Err(err) => err.into(),
        }
    }

    async fn fetch_where_state(&self, state: EntryState) -> StoreResult<Vec<QueueEntry>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            " FROM queue_entries WHERE state = ?1 ORDER BY created_at ASC, seq ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn insert(&self, entry: QueueEntry) -> StoreResult<()> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| StoreError::Storage(format!("failed to encode metadata: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_entries (
                id,
                payload,
                metadata,
                state,
                attempt_count,
                created_at,
                next_attempt_at,
                last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.payload.as_slice())
        .bind(metadata)
        .bind(entry.state.as_str())
        .bind(i64::from(entry.attempt_count))
        .bind(encode_ts(entry.created_at))
        .bind(encode_ts(entry.next_attempt_at))
        .bind(entry.last_error.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(entry.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            " FROM queue_entries WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueueEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            r#"
            FROM queue_entries
            WHERE state = 'pending'
              AND next_attempt_at <= ?1
            ORDER BY created_at ASC, seq ASC
            LIMIT ?2
            "#
        ))
        .bind(encode_ts(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn mark_sending(&self, id: EntryId) -> StoreResult<QueueEntry> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE queue_entries
            SET state = 'sending'
            WHERE id = ?1
              AND state = 'pending'
            RETURNING "#,
            entry_columns!()
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(self.conflict_or_missing(id, EntryState::Pending).await),
        }
    }

    async fn mark_succeeded(&self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE id = ?1
              AND state = 'sending'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id, EntryState::Sending).await);
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: EntryId,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> StoreResult<QueueEntry> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE queue_entries
            SET state = 'pending',
                attempt_count = attempt_count + 1,
                next_attempt_at = ?2,
                last_error = ?3
            WHERE id = ?1
              AND state = 'sending'
            RETURNING "#,
            entry_columns!()
        ))
        .bind(id.to_string())
        .bind(encode_ts(next_attempt_at))
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(self.conflict_or_missing(id, EntryState::Sending).await),
        }
    }

    async fn mark_dead_lettered(&self, id: EntryId, error: String) -> StoreResult<QueueEntry> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE queue_entries
            SET state = 'dead_lettered',
                attempt_count = attempt_count + 1,
                last_error = ?2
            WHERE id = ?1
              AND state = 'sending'
            RETURNING "#,
            entry_columns!()
        ))
        .bind(id.to_string())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(self.conflict_or_missing(id, EntryState::Sending).await),
        }
    }

    async fn list_dead_lettered(&self) -> StoreResult<Vec<QueueEntry>> {
        self.fetch_where_state(EntryState::DeadLettered).await
    }

    async fn count(&self) -> StoreResult<QueueCounts> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n
            FROM queue_entries
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = usize::try_from(row.try_get::<i64, _>("n")?).unwrap_or(0);
            match EntryState::parse(&state) {
                Some(EntryState::Pending) => counts.pending = n,
                Some(EntryState::Sending) => counts.sending = n,
                Some(EntryState::DeadLettered) => counts.dead_lettered = n,
                None => return Err(StoreError::Corrupt(format!("unknown state '{state}'"))),
            }
        }

        let oldest: Option<String> = sqlx::query(
            r#"
            SELECT MIN(created_at) AS oldest
            FROM queue_entries
            WHERE state IN ('pending', 'sending')
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("oldest")?;

        counts.oldest_pending_created_at = oldest.as_deref().map(decode_ts).transpose()?;
        Ok(counts)
    }

    async fn recover_in_flight(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET state = 'pending',
                next_attempt_at = ?1
            WHERE state = 'sending'
            "#,
        )
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn requeue_dead_letter(
        &self,
        id: EntryId,
        now: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE queue_entries
            SET state = 'pending',
                next_attempt_at = ?2
            WHERE id = ?1
              AND state = 'dead_lettered'
            RETURNING "#,
            entry_columns!()
        ))
        .bind(id.to_string())
        .bind(encode_ts(now))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(self.conflict_or_missing(id, EntryState::DeadLettered).await),
        }
    }

    async fn purge_dead_letter(&self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE id = ?1
              AND state = 'dead_lettered'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id, EntryState::DeadLettered).await);
        }
        Ok(())
    }
}

fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{s}': {e}")))
}

/// Map a database row into a `QueueEntry`.
fn row_to_entry(row: &SqliteRow) -> StoreResult<QueueEntry> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<EntryId>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let payload: Vec<u8> = row.try_get("payload")?;

    let metadata_str: String = row.try_get("metadata")?;
    let metadata: Metadata = serde_json::from_str(&metadata_str)
        .map_err(|e| StoreError::Corrupt(format!("invalid metadata for {id}: {e}")))?;

    let state_str: String = row.try_get("state")?;
    let state = EntryState::parse(&state_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown state '{state_str}' for {id}")))?;

    let attempt_count = u32::try_from(row.try_get::<i64, _>("attempt_count")?)
        .map_err(|e| StoreError::Corrupt(format!("invalid attempt_count for {id}: {e}")))?;

    let created_at = decode_ts(&row.try_get::<String, _>("created_at")?)?;
    let next_attempt_at = decode_ts(&row.try_get::<String, _>("next_attempt_at")?)?;
    let last_error: Option<String> = row.try_get("last_error")?;

    Ok(QueueEntry {
        id,
        payload,
        metadata,
        created_at,
        attempt_count,
        next_attempt_at,
        state,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteQueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteQueueStore::open(dir.path().join("queue.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn entry_at(now: DateTime<Utc>) -> QueueEntry {
        let mut metadata = Metadata::new();
        metadata.insert("kind".into(), "memory".into());
        QueueEntry::new(br#"{"q":"hi","a":"hello"}"#.to_vec(), metadata, now)
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(encode_ts(early) < encode_ts(late));
        assert_eq!(decode_ts(&encode_ts(late)).unwrap(), late);
    }

    #[tokio::test]
    async fn insert_get_round_trips_all_fields() {
        let (_dir, store) = open_temp().await;
        let entry = entry_at(Utc::now());
        store.insert(entry.clone()).await.unwrap();

        let loaded = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(loaded, entry);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let (_dir, store) = open_temp().await;
        let entry = entry_at(Utc::now());
        store.insert(entry.clone()).await.unwrap();

        let err = store.insert(entry).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (_dir, store) = open_temp().await;
        let entry = entry_at(Utc::now());
        let id = entry.id;
        store.insert(entry).await.unwrap();

        store.mark_sending(id).await.unwrap();
        assert!(store.mark_sending(id).await.unwrap_err().is_conflict());
        assert!(store.mark_sending(EntryId::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn ready_list_is_fifo_and_time_gated() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();

        let first = entry_at(now);
        let second = entry_at(now);
        let mut later = entry_at(now - chrono::Duration::seconds(5));
        later.next_attempt_at = now + chrono::Duration::seconds(60);
        let (first_id, second_id) = (first.id, second.id);
        for e in [first, second, later] {
            store.insert(e).await.unwrap();
        }

        let ready: Vec<EntryId> = store
            .list_ready(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ready, vec![first_id, second_id]);
        assert_eq!(store.list_ready(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_and_dead_letter_transitions() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        let entry = entry_at(now);
        let id = entry.id;
        store.insert(entry).await.unwrap();

        store.mark_sending(id).await.unwrap();
        let next = now + chrono::Duration::seconds(30);
        let retried = store.mark_retry(id, next, "503".into()).await.unwrap();
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.next_attempt_at, next);
        assert_eq!(retried.state, EntryState::Pending);

        store.mark_sending(id).await.unwrap();
        let dead = store.mark_dead_lettered(id, "401".into()).await.unwrap();
        assert_eq!(dead.attempt_count, 2);
        assert_eq!(dead.last_error.as_deref(), Some("401"));

        let counts = store.count().await.unwrap();
        assert_eq!(counts.dead_lettered, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.oldest_pending_created_at, None);
    }

    #[tokio::test]
    async fn latest_schedulable_retry_is_never_ready() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        let entry = entry_at(now);
        let id = entry.id;
        store.insert(entry).await.unwrap();

        store.mark_sending(id).await.unwrap();
        let latest = crate::processor::latest_schedulable();
        store.mark_retry(id, latest, "down".into()).await.unwrap();

        assert!(store.list_ready(now, 10).await.unwrap().is_empty());
        assert_eq!(store.get(id).await.unwrap().unwrap().next_attempt_at, latest);
        assert!(encode_ts(now) < encode_ts(latest));
    }

    #[tokio::test]
    async fn success_requires_a_claim_and_deletes() {
        let (_dir, store) = open_temp().await;
        let entry = entry_at(Utc::now());
        let id = entry.id;
        store.insert(entry).await.unwrap();

        assert!(store.mark_succeeded(id).await.unwrap_err().is_conflict());

        store.mark_sending(id).await.unwrap();
        store.mark_succeeded(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_survive_reopen_and_in_flight_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let now = Utc::now();

        let (pending_id, sending_id) = {
            let store = SqliteQueueStore::open(&path).await.unwrap();
            let pending = entry_at(now);
            let sending = entry_at(now);
            let ids = (pending.id, sending.id);
            store.insert(pending).await.unwrap();
            store.insert(sending).await.unwrap();
            store.mark_sending(ids.1).await.unwrap();
            store.close().await;
            ids
        };

        let store = SqliteQueueStore::open(&path).await.unwrap();
        let restart = now + chrono::Duration::seconds(2);
        assert_eq!(store.recover_in_flight(restart).await.unwrap(), 1);

        let ready: Vec<EntryId> = store
            .list_ready(restart, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ready, vec![pending_id, sending_id]);
    }

    #[tokio::test]
    async fn requeue_and_purge_dead_letters() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        let a = entry_at(now);
        let b = entry_at(now);
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        for id in [a_id, b_id] {
            store.mark_sending(id).await.unwrap();
            store.mark_dead_lettered(id, "422".into()).await.unwrap();
        }

        let requeued = store.requeue_dead_letter(a_id, now).await.unwrap();
        assert_eq!(requeued.state, EntryState::Pending);
        assert_eq!(requeued.attempt_count, 1);

        store.purge_dead_letter(b_id).await.unwrap();
        assert!(store.list_dead_lettered().await.unwrap().is_empty());
        assert!(store.purge_dead_letter(b_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn concurrent_claims_have_a_single_winner() {
        let (_dir, store) = open_temp().await;
        let entry = entry_at(Utc::now());
        let id = entry.id;
        store.insert(entry).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.mark_sending(id).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
