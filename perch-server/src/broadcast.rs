//! Event broadcaster - pushes app snapshots and theme changes to every
//! connected SSE client
//!
//! Messages are serialized once and shared. A subscriber that falls a full
//! buffer behind is disconnected rather than allowed to stall producers;
//! `EventSource` reconnects and gets a fresh snapshot.

use crate::instances::RunnerEvent;
use crate::supervisor::Supervisor;
use parking_lot::Mutex;
use perch_core::{StreamMessage, Theme};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{MissedTickBehavior, interval};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<str>>,
}

struct Hub {
    subs: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    hub: Arc<Hub>,
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                subs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a subscriber whose first message is `initial()`.
    ///
    /// `initial` runs while the subscriber list is locked, so no publish can
    /// land between the snapshot and the registration.
    pub fn subscribe_with(&self, initial: impl FnOnce() -> String) -> Subscription {
        let (tx, rx) = mpsc::channel(self.hub.buffer);
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subs = self.hub.subs.lock();
        let first: Arc<str> = initial().into();
        // Fresh channel with capacity >= 1: cannot fail.
        let _ = tx.try_send(first);
        subs.push(Subscriber { id, tx });
        tracing::debug!(subscriber = id, clients = subs.len(), "Client subscribed");
        drop(subs);

        Subscription {
            id,
            rx,
            broadcaster: self.clone(),
        }
    }

    /// Send a message to every subscriber. `build` is only called when
    /// someone is listening.
    pub fn publish_with(&self, build: impl FnOnce() -> String) {
        let mut subs = self.hub.subs.lock();
        if subs.is_empty() {
            return;
        }
        let message: Arc<str> = build().into();
        subs.retain(|sub| match sub.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = sub.id, "Client too slow, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn publish_snapshot(&self, supervisor: &Supervisor) {
        self.publish_with(|| StreamMessage::Snapshot(supervisor.snapshot()).to_json());
    }

    pub fn publish_theme(&self, theme: Theme) {
        self.publish_with(|| StreamMessage::theme(theme).to_json());
    }

    pub fn client_count(&self) -> usize {
        self.hub.subs.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        let mut subs = self.hub.subs.lock();
        subs.retain(|sub| sub.id != id);
        tracing::debug!(subscriber = id, clients = subs.len(), "Client unsubscribed");
    }
}

/// Receiving end of one client; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    broadcaster: EventBroadcaster,
}

impl Subscription {
    /// Next message, or `None` once the broadcaster dropped this client.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

/// Push a snapshot on every runner transition, and once per `refresh` while
/// clients are connected so uptimes and log-driven views keep moving.
pub async fn run_fanout(
    broadcaster: EventBroadcaster,
    supervisor: Arc<Supervisor>,
    mut events: mpsc::Receiver<RunnerEvent>,
    refresh: Duration,
) {
    let mut ticker = interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                tracing::debug!(service = %event.service, status = %event.status, "Status changed");
                // Coalesce a burst into one snapshot.
                while events.try_recv().is_ok() {}
                broadcaster.publish_snapshot(&supervisor);
            }
            _ = ticker.tick() => {
                if broadcaster.client_count() > 0 {
                    broadcaster.publish_snapshot(&supervisor);
                }
            }
        }
    }
    tracing::debug!("Event fan-out stopped");
}
