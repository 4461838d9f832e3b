//! Drain loop: claims ready entries, attempts the remote write, and records
//! the outcome through the store's atomic transitions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use memsync_core::{EntryId, SharedClock, SystemClock};

use crate::backoff::BackoffPolicy;
use crate::classifier::{Classification, ErrorClassifier};
use crate::config::{ConfigError, QueueConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::remote::{RemoteWriter, WriteFailure, WriteRequest};
use crate::store::{QueueStore, StoreResult};
use crate::types::QueueEntry;

/// Result of a call to [`QueueProcessor::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// This call ran one or more cycles.
    Completed(DrainReport),
    /// Another drain was running; it will run again on this caller's behalf.
    Coalesced,
    /// Connectivity is down; nothing was touched.
    Offline,
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub cycles: u32,
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Entries another caller claimed or removed first.
    pub skipped: usize,
    pub store_errors: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Succeeded => self.succeeded += 1,
            EntryOutcome::Retried => self.retried += 1,
            EntryOutcome::DeadLettered => self.dead_lettered += 1,
            EntryOutcome::Skipped => self.skipped += 1,
            EntryOutcome::StoreError { .. } => self.store_errors += 1,
        }
        if outcome.was_attempted() {
            self.attempted += 1;
        }
    }

    /// Count an outcome replayed from an earlier attempt.
    fn record_settled(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Succeeded => self.succeeded += 1,
            EntryOutcome::Retried => self.retried += 1,
            EntryOutcome::DeadLettered => self.dead_lettered += 1,
            EntryOutcome::Skipped | EntryOutcome::StoreError { .. } => {}
        }
    }

    fn merge(&mut self, other: &DrainReport) {
        self.cycles += other.cycles;
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.skipped += other.skipped;
        self.store_errors += other.store_errors;
    }
}

/// Lifetime counters of a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub drains: u64,
    pub coalesced: u64,
    pub offline_skips: u64,
    pub cycles: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
    pub store_errors: u64,
    pub recovered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    drains: AtomicU64,
    coalesced: AtomicU64,
    offline_skips: AtomicU64,
    cycles: AtomicU64,
    attempts: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
    store_errors: AtomicU64,
    recovered: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn absorb(&self, report: &DrainReport) {
        Self::add(&self.cycles, report.cycles as usize);
        Self::add(&self.attempts, report.attempted);
        Self::add(&self.succeeded, report.succeeded);
        Self::add(&self.retried, report.retried);
        Self::add(&self.dead_lettered, report.dead_lettered);
        Self::add(&self.skipped, report.skipped);
        Self::add(&self.store_errors, report.store_errors);
    }

    fn snapshot(&self) -> ProcessorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ProcessorStats {
            drains: load(&self.drains),
            coalesced: load(&self.coalesced),
            offline_skips: load(&self.offline_skips),
            cycles: load(&self.cycles),
            attempts: load(&self.attempts),
            succeeded: load(&self.succeeded),
            retried: load(&self.retried),
            dead_lettered: load(&self.dead_lettered),
            skipped: load(&self.skipped),
            store_errors: load(&self.store_errors),
            recovered: load(&self.recovered),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Succeeded,
    Retried,
    DeadLettered,
    Skipped,
    StoreError { attempted: bool },
}

/// Store transition owed for a finished attempt.
#[derive(Debug, Clone)]
enum Settlement {
    Delivered,
    Retry {
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    DeadLetter {
        error: String,
    },
}

#[derive(Debug)]
struct Unsettled {
    id: EntryId,
    settlement: Settlement,
}

impl EntryOutcome {
    fn was_attempted(self) -> bool {
        match self {
            EntryOutcome::Skipped => false,
            EntryOutcome::StoreError { attempted } => attempted,
            _ => true,
        }
    }
}

/// Single-flight queue drainer.
///
/// Any number of tasks may call [`drain`](Self::drain) concurrently; at most
/// one runs cycles at a time and the others only request a follow-up cycle.
pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    writer: Arc<dyn RemoteWriter>,
    clock: SharedClock,
    backoff: BackoffPolicy,
    classifier: ErrorClassifier,
    connectivity: Option<ConnectivityMonitor>,
    attempt_timeout: Duration,
    batch_size: usize,
    max_cycles_per_drain: u32,
    drain_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    unsettled: Mutex<Vec<Unsettled>>,
    counters: Counters,
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("backoff", &self.backoff)
            .field("classifier", &self.classifier)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("batch_size", &self.batch_size)
            .field("max_cycles_per_drain", &self.max_cycles_per_drain)
            .finish_non_exhaustive()
    }
}

impl QueueProcessor {
    /// Create a processor with default settings and the system clock.
    pub fn new(store: Arc<dyn QueueStore>, writer: Arc<dyn RemoteWriter>) -> Self {
        let defaults = QueueConfig::default();
        Self {
            store,
            writer,
            clock: Arc::new(SystemClock),
            backoff: BackoffPolicy::default(),
            classifier: ErrorClassifier::default(),
            connectivity: None,
            attempt_timeout: defaults.attempt_timeout(),
            batch_size: defaults.batch_size,
            max_cycles_per_drain: defaults.max_cycles_per_drain,
            drain_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            unsettled: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Create a processor from a validated configuration.
    pub fn from_config(
        store: Arc<dyn QueueStore>,
        writer: Arc<dyn RemoteWriter>,
        config: &QueueConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(store, writer)
            .with_backoff(config.backoff.policy()?)
            .with_classifier(config.backoff.classifier())
            .with_attempt_timeout(config.attempt_timeout())
            .with_batch_size(config.batch_size)
            .with_max_cycles_per_drain(config.max_cycles_per_drain))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Gate drains on this monitor's state.
    pub fn with_connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_cycles_per_drain(mut self, max: u32) -> Self {
        self.max_cycles_per_drain = max.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn connectivity(&self) -> Option<&ConnectivityMonitor> {
        self.connectivity.as_ref()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    fn is_online(&self) -> bool {
        self.connectivity.as_ref().is_none_or(|m| m.is_online())
    }

    /// Startup repair: reset entries left `Sending` to `Pending`.
    ///
    /// Waits for a running drain of this processor to finish first, so an
    /// entry with an attempt still in progress is never reset under it.
    pub async fn recover_in_flight(&self) -> StoreResult<usize> {
        let _guard = self.drain_lock.lock().await;

        let mut report = DrainReport::default();
        self.settle_unsettled(&mut report).await;
        self.counters.absorb(&report);

        let recovered = self.store.recover_in_flight(self.clock.now()).await?;
        self.counters
            .recovered
            .fetch_add(recovered as u64, Ordering::Relaxed);
        if recovered > 0 {
            info!(recovered, "recovered in-flight entries from previous run");
        }
        Ok(recovered)
    }

    /// Drain ready entries.
    ///
    /// If a drain is already running this returns [`DrainOutcome::Coalesced`]
    /// immediately and the running drain performs one more cycle before it
    /// finishes.
    pub async fn drain(&self) -> DrainOutcome {
        if !self.is_online() {
            self.counters.offline_skips.fetch_add(1, Ordering::Relaxed);
            debug!("offline; drain skipped");
            return DrainOutcome::Offline;
        }

        let mut total = DrainReport::default();
        let mut ran = false;

        loop {
            let Ok(guard) = self.drain_lock.try_lock() else {
                self.rerun.store(true, Ordering::SeqCst);
                if ran {
                    break;
                }
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("drain already running; requested another cycle");
                return DrainOutcome::Coalesced;
            };
            ran = true;
            self.rerun.store(false, Ordering::SeqCst);

            let (report, exhausted) = self.run_cycles().await;
            total.merge(&report);
            drop(guard);

            // A request that raced with the final check is picked up here.
            if exhausted || !self.rerun.load(Ordering::SeqCst) || !self.is_online() {
                break;
            }
        }

        self.counters.drains.fetch_add(1, Ordering::Relaxed);
        if total.attempted > 0 || total.store_errors > 0 {
            info!(
                cycles = total.cycles,
                attempted = total.attempted,
                succeeded = total.succeeded,
                retried = total.retried,
                dead_lettered = total.dead_lettered,
                store_errors = total.store_errors,
                "drain finished"
            );
        }
        DrainOutcome::Completed(total)
    }

    /// Run cycles under the drain lock. Returns the report and whether the
    /// cycle budget ran out.
    async fn run_cycles(&self) -> (DrainReport, bool) {
        let mut report = DrainReport::default();
        loop {
            let (cycle, listed) = self.run_cycle().await;
            self.counters.absorb(&cycle);
            report.merge(&cycle);

            let full_batch = listed >= self.batch_size && cycle.store_errors == 0;
            let requested = self.rerun.swap(false, Ordering::SeqCst);
            if !(full_batch || requested) || !self.is_online() {
                return (report, false);
            }
            if report.cycles >= self.max_cycles_per_drain {
                debug!(
                    cycles = report.cycles,
                    "cycle budget spent; leaving remaining entries for the next wake"
                );
                return (report, true);
            }
        }
    }

    async fn run_cycle(&self) -> (DrainReport, usize) {
        let mut report = DrainReport {
            cycles: 1,
            ..DrainReport::default()
        };
        self.settle_unsettled(&mut report).await;

        let now = self.clock.now();
        let ready = match self.store.list_ready(now, self.batch_size).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "failed to list ready entries");
                report.store_errors += 1;
                return (report, 0);
            }
        };
        let listed = ready.len();
        if listed > 0 {
            debug!(ready = listed, "drain cycle started");
        }

        for entry in &ready {
            if !self.is_online() {
                debug!("went offline mid-cycle; stopping");
                break;
            }
            let outcome = self.process_entry(entry).await;
            report.record(outcome);
        }

        (report, listed)
    }

    async fn process_entry(&self, entry: &QueueEntry) -> EntryOutcome {
        let claimed = match self.store.mark_sending(entry.id).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(entry_id = %entry.id, error = %e, "entry no longer claimable; skipping");
                return EntryOutcome::Skipped;
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "failed to claim entry");
                return EntryOutcome::StoreError { attempted: false };
            }
        };

        let request = WriteRequest::for_entry(&claimed);
        let attempt = request.attempt;
        debug!(entry_id = %claimed.id, attempt, "writing entry to remote");

        let result = match tokio::time::timeout(self.attempt_timeout, self.writer.write(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(WriteFailure::timeout(format!(
                "no response within {}ms",
                self.attempt_timeout.as_millis()
            ))),
        };

        let settlement = match result {
            Ok(()) => Settlement::Delivered,
            Err(failure) => self.settlement_for(&claimed, attempt, &failure),
        };
        self.settle(claimed.id, attempt, settlement).await
    }

    fn settlement_for(
        &self,
        claimed: &QueueEntry,
        attempt: u32,
        failure: &WriteFailure,
    ) -> Settlement {
        let classification = self.classifier.classify(failure);
        let error = failure.to_string();

        let give_up = match classification {
            Classification::Terminal => true,
            Classification::Retryable => !self.backoff.should_retry(attempt, false),
            Classification::Unknown => !self.backoff.should_retry(attempt, true),
        };

        if give_up {
            error!(
                entry_id = %claimed.id,
                attempts = attempt,
                classification = ?classification,
                error = %failure,
                "giving up on entry"
            );
            return Settlement::DeadLetter { error };
        }

        let delay = self.backoff.next_delay(attempt);
        warn!(
            entry_id = %claimed.id,
            attempts = attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %failure,
            "remote write failed; scheduling retry"
        );
        Settlement::Retry {
            next_attempt_at: schedule_after(self.clock.now(), delay),
            error,
        }
    }

    /// Record the outcome of a finished attempt. If the store refuses, the
    /// transition is kept and replayed at the start of the next cycle.
    async fn settle(&self, id: EntryId, attempt: u32, settlement: Settlement) -> EntryOutcome {
        match self.apply(id, &settlement).await {
            Ok(outcome) => {
                debug!(entry_id = %id, attempt, outcome = ?outcome, "attempt recorded");
                outcome
            }
            Err(e) => {
                error!(
                    entry_id = %id,
                    error = %e,
                    settlement = ?settlement,
                    "failed to record attempt; will replay next cycle"
                );
                self.unsettled_list().push(Unsettled { id, settlement });
                EntryOutcome::StoreError { attempted: true }
            }
        }
    }

    async fn apply(&self, id: EntryId, settlement: &Settlement) -> StoreResult<EntryOutcome> {
        match settlement {
            Settlement::Delivered => {
                self.store.mark_succeeded(id).await?;
                Ok(EntryOutcome::Succeeded)
            }
            Settlement::Retry {
                next_attempt_at,
                error,
            } => {
                self.store
                    .mark_retry(id, *next_attempt_at, error.clone())
                    .await?;
                Ok(EntryOutcome::Retried)
            }
            Settlement::DeadLetter { error } => {
                self.store.mark_dead_lettered(id, error.clone()).await?;
                Ok(EntryOutcome::DeadLettered)
            }
        }
    }

    /// Replay transitions the store refused earlier.
    ///
    /// Entries that moved on in the meantime (recovered, claimed or removed
    /// elsewhere) are dropped from the list.
    async fn settle_unsettled(&self, report: &mut DrainReport) {
        let pending = std::mem::take(&mut *self.unsettled_list());
        for Unsettled { id, settlement } in pending {
            match self.apply(id, &settlement).await {
                Ok(outcome) => {
                    info!(entry_id = %id, outcome = ?outcome, "replayed attempt outcome");
                    report.record_settled(outcome);
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(entry_id = %id, error = %e, "entry moved on; dropping stale outcome");
                }
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "replaying attempt outcome failed");
                    report.store_errors += 1;
                    self.unsettled_list().push(Unsettled { id, settlement });
                }
            }
        }
    }

    fn unsettled_list(&self) -> std::sync::MutexGuard<'_, Vec<Unsettled>> {
        self.unsettled.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attempt outcomes waiting to be replayed into the store.
    pub fn unsettled(&self) -> usize {
        self.unsettled_list().len()
    }
}

/// Latest instant a retry is scheduled for, 9999-12-31T23:59:59Z.
///
/// Stored timestamps stay fixed-width RFC 3339 up to here, so text order
/// still matches time order.
pub fn latest_schedulable() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_SCHEDULE_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

const LATEST_SCHEDULE_SECS: i64 = 253_402_300_799;

fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let latest = latest_schedulable();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or(latest, |at| at.min(latest))
}
