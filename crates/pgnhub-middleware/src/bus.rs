//! Broadcast hub: best-effort fan-out to real-time subscribers.
//!
//! Every subscriber owns a bounded queue. [`BroadcastHub::publish`] walks the
//! subscriber arena once and uses `try_send`, so a slow consumer simply
//! misses messages and never blocks the producer; a subscriber whose
//! receiving end is gone is pruned on the spot.
//!
//! Dropping a [`Subscription`] unsubscribes it, which is how a closed client
//! connection removes itself without an explicit call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use pgnhub_types::BroadcastMessage;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default per-subscriber queue depth.
pub const DEFAULT_CAPACITY: usize = 256;

/// Key into the subscriber arena.
pub type SubscriberId = u64;

/// Outcome of a single [`BroadcastHub::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that accepted the message.
    pub delivered: usize,
    /// Subscribers whose queue was full; they miss this message.
    pub skipped: usize,
    /// Subscribers found closed and removed.
    pub pruned: usize,
}

struct HubInner {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, mpsc::Sender<BroadcastMessage>>,
}

/// Shared hub. Clone it cheaply – all clones share one subscriber arena.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubInner>>,
    capacity: usize,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl BroadcastHub {
    /// Create a hub whose subscribers buffer up to `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_id: 1,
                subscribers: HashMap::new(),
            })),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, tx);
            id
        };
        debug!(subscriber = id, "subscriber registered");
        Subscription {
            id,
            hub: self.clone(),
            receiver: rx,
        }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Deliver `message` to every open subscriber without waiting.
    pub fn publish(&self, message: BroadcastMessage) -> PublishReport {
        let mut report = PublishReport::default();
        let mut inner = self.lock();
        inner.subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(subscriber = id, event = %message.event, "subscriber queue full, message skipped");
                report.skipped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                report.pruned += 1;
                false
            }
        });
        report
    }

    /// Deliver `message` to one subscriber only (e.g. a status snapshot).
    pub fn send_to(&self, id: SubscriberId, message: BroadcastMessage) -> bool {
        let inner = self.lock();
        inner
            .subscribers
            .get(&id)
            .is_some_and(|tx| tx.try_send(message).is_ok())
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving end of one subscriber. Unsubscribes on drop.
pub struct Subscription {
    id: SubscriberId,
    hub: BroadcastHub,
    receiver: mpsc::Receiver<BroadcastMessage>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next message. `None` once the subscription was removed
    /// from the hub and the queue is drained.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
