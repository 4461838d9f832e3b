#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use memsync_queue::{
    EntryId, ManualClock, QueueConfig, RemoteWriter, WriteFailure, WriteRequest,
};

/// What the fake remote does with one call.
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    Fail(WriteFailure),
    /// Sleep before answering `Ok`; long enough sleeps trip the attempt timeout.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<Step>,
    calls: Vec<WriteRequest>,
    in_flight: HashSet<EntryId>,
    overlaps: usize,
}

/// Scripted stand-in for the remote store.
///
/// Replays `script` in order and answers `Ok` once it runs out. Records every
/// request and counts writes that overlapped for the same entry.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    latency: Duration,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        let remote = Self::default();
        remote.state.lock().unwrap().script = steps.into_iter().collect();
        Arc::new(remote)
    }

    /// Every call takes `latency` before answering.
    pub fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<WriteRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| String::from_utf8(c.payload.clone()).unwrap())
            .collect()
    }

    pub fn overlaps(&self) -> usize {
        self.state.lock().unwrap().overlaps
    }
}

#[async_trait]
impl RemoteWriter for FakeRemote {
    async fn write(&self, request: &WriteRequest) -> Result<(), WriteFailure> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(request.clone());
            if !state.in_flight.insert(request.entry_id) {
                state.overlaps += 1;
            }
            state.script.pop_front().unwrap_or(Step::Ok)
        };

        // Released on drop, so a write cancelled by the attempt timeout still clears.
        let _in_flight = InFlight {
            remote: self,
            id: request.entry_id,
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match step {
            Step::Ok => Ok(()),
            Step::Fail(failure) => Err(failure),
            Step::Stall(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

struct InFlight<'a> {
    remote: &'a FakeRemote,
    id: EntryId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.remote.state.lock() {
            state.in_flight.remove(&self.id);
        }
    }
}

pub fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 15, 8, 30, 0).unwrap())
}

/// Config with the worker timer effectively disabled and no debounce.
pub fn quiet_config() -> QueueConfig {
    QueueConfig::default()
        .with_tick_interval(Duration::from_secs(3600))
        .with_connectivity_debounce(Duration::ZERO)
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
