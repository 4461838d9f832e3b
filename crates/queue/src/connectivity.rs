//! Reachability tracking with debounced "back online" notifications.
//!
//! The platform probe (outside this crate) calls [`ConnectivityMonitor::report`]
//! whenever it observes a change. Subscribers get one [`OnlineEvent`] per
//! offline→online transition that holds for the debounce window; a link that
//! flaps inside the window produces a single event once it settles.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 16;

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Remote store reachable.
    Online,
    /// Network unreachable.
    Offline,
}

/// Emitted once per settled offline→online transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineEvent {
    /// 1-based count of online events emitted by this monitor.
    pub sequence: u64,
}

#[derive(Debug)]
struct LinkState {
    current: ConnectivityState,
    /// Bumped on every state change; a pending debounce only fires if unchanged.
    epoch: u64,
    emitted: u64,
}

#[derive(Debug)]
struct MonitorInner {
    link: Mutex<LinkState>,
    events: broadcast::Sender<OnlineEvent>,
    debounce: Duration,
}

impl MonitorInner {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, link: &mut LinkState) {
        link.emitted += 1;
        let event = OnlineEvent {
            sequence: link.emitted,
        };
        tracing::info!(sequence = event.sequence, "connectivity restored");
        // No subscribers is fine; the state is still observable via `state()`.
        let _ = self.events.send(event);
    }

    fn fire_if_settled(&self, epoch: u64) {
        let mut link = self.link();
        if link.epoch == epoch && link.current == ConnectivityState::Online {
            self.emit(&mut link);
        } else {
            tracing::debug!("online transition superseded within debounce window");
        }
    }
}

/// Cheaply cloneable handle onto the shared reachability state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in `initial` state.
    ///
    /// A zero `debounce` emits online events synchronously from `report`.
    pub fn new(initial: ConnectivityState, debounce: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                link: Mutex::new(LinkState {
                    current: initial,
                    epoch: 0,
                    emitted: 0,
                }),
                events,
                debounce,
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.link().current
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Number of online events emitted so far.
    pub fn online_events(&self) -> u64 {
        self.inner.link().emitted
    }

    /// Register for online events. Drop the subscription to unsubscribe.
    pub fn subscribe(&self) -> OnlineSubscription {
        OnlineSubscription {
            receiver: self.inner.events.subscribe(),
        }
    }

    pub fn set_online(&self) {
        self.report(ConnectivityState::Online);
    }

    pub fn set_offline(&self) {
        self.report(ConnectivityState::Offline);
    }

    /// Record an observed reachability state.
    ///
    /// Repeated reports of the current state are ignored. With a non-zero
    /// debounce this must be called from within a tokio runtime; outside one
    /// the event fires immediately.
    pub fn report(&self, state: ConnectivityState) {
        let mut link = self.inner.link();
        if link.current == state {
            return;
        }
        link.current = state;
        link.epoch += 1;

        match state {
            ConnectivityState::Offline => {
                tracing::info!("connectivity lost");
            }
            ConnectivityState::Online if self.inner.debounce.is_zero() => {
                self.inner.emit(&mut link);
            }
            ConnectivityState::Online => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let epoch = link.epoch;
                    let inner = Arc::clone(&self.inner);
                    let debounce = self.inner.debounce;
                    handle.spawn(async move {
                        tokio::time::sleep(debounce).await;
                        inner.fire_if_settled(epoch);
                    });
                }
                Err(_) => {
                    tracing::debug!("no runtime for debounce; emitting online event immediately");
                    self.inner.emit(&mut link);
                }
            },
        }
    }
}

/// Receiver side of the online event stream.
#[derive(Debug)]
pub struct OnlineSubscription {
    receiver: broadcast::Receiver<OnlineEvent>,
}

impl OnlineSubscription {
    /// Wait for the next online event; `None` once the monitor is gone.
    pub async fn recv(&mut self) -> Option<OnlineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                // Missed events collapse into the next one still buffered.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<OnlineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
