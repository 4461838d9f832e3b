//! Background task that keeps the queue draining.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connectivity::OnlineSubscription;
use crate::processor::{DrainOutcome, QueueProcessor};

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    wake: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to drain soon. Coalesces with pending requests.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the task to exit.
    ///
    /// A drain in progress finishes its current cycle first.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "queue worker task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Drains on a timer, on wake requests, and when connectivity returns.
pub struct QueueWorker {
    processor: Arc<QueueProcessor>,
    tick_interval: Duration,
    online: Option<OnlineSubscription>,
}

impl QueueWorker {
    pub fn new(processor: Arc<QueueProcessor>, tick_interval: Duration) -> Self {
        let online = processor.connectivity().map(|m| m.subscribe());
        Self {
            processor,
            tick_interval,
            online,
        }
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let wake = Arc::new(Notify::new());
        let join = tokio::spawn(run(self, Arc::clone(&shutdown), Arc::clone(&wake)));
        WorkerHandle {
            shutdown,
            wake,
            join: Some(join),
        }
    }
}

async fn next_online(online: &mut Option<OnlineSubscription>) -> Option<u64> {
    match online {
        Some(sub) => sub.recv().await.map(|event| event.sequence),
        None => std::future::pending().await,
    }
}

async fn run(mut worker: QueueWorker, shutdown: Arc<Notify>, wake: Arc<Notify>) {
    tracing::info!(
        tick_ms = worker.tick_interval.as_millis() as u64,
        "queue worker started"
    );

    let mut ticker = tokio::time::interval(worker.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("queue worker received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                drain(&worker.processor, "timer").await;
            }
            _ = wake.notified() => {
                drain(&worker.processor, "wake").await;
            }
            event = next_online(&mut worker.online) => match event {
                Some(sequence) => {
                    tracing::debug!(sequence, "online event");
                    drain(&worker.processor, "online").await;
                }
                None => {
                    tracing::debug!("connectivity monitor dropped; relying on timer");
                    worker.online = None;
                }
            },
        }
    }

    tracing::info!("queue worker stopped");
}

async fn drain(processor: &QueueProcessor, trigger: &'static str) {
    match processor.drain().await {
        DrainOutcome::Completed(report) if report.attempted > 0 => {
            tracing::debug!(trigger, attempted = report.attempted, "triggered drain done");
        }
        DrainOutcome::Completed(_) | DrainOutcome::Coalesced | DrainOutcome::Offline => {}
    }
}
