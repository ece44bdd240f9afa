//! Fan-out hub delivering stored attacks to live-feed subscribers
//!
//! Each subscriber owns a bounded ring queue and a dedicated drain task.
//! Publishing appends to every active queue and never blocks: a slow
//! consumer only loses its own oldest entries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::model::{EnrichedAttack, FeedMessage};

/// One live-feed channel. The broadcaster writes serialized attacks to it
/// from the subscriber's drain task.
#[async_trait]
pub trait FeedTransport: Send {
    async fn send(&mut self, payload: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberState {
    Registering,
    Active,
    Draining,
    Closed,
}

struct Subscriber {
    id: u64,
    state: Mutex<SubscriberState>,
    queue: Mutex<VecDeque<Arc<str>>>,
    notify: Notify,
    registered_at: DateTime<Utc>,
    dropped: AtomicU64,
}

impl Subscriber {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(SubscriberState::Registering),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            registered_at: Utc::now(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Ring-buffer semantics: on overflow the oldest queued item is lost.
    fn push(&self, payload: Arc<str>, bound: usize) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= bound {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(payload);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<str>> {
        self.queue.lock().unwrap().pop_front()
    }

    fn state(&self) -> SubscriberState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SubscriberState) {
        *self.state.lock().unwrap() = state;
    }

    fn close(&self) {
        self.set_state(SubscriberState::Closed);
        self.notify.notify_waiters();
    }

    /// Flush-then-exit: the drain task delivers what is already queued,
    /// then stops.
    fn drain(&self) {
        self.set_state(SubscriberState::Draining);
        self.notify.notify_waiters();
    }
}

pub struct Broadcaster {
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    queue_bound: usize,
    published: AtomicU64,
    // Serializes publishers so every subscriber sees the same order.
    publish_lock: Mutex<()>,
}

impl Broadcaster {
    pub fn new(queue_bound: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_bound,
            published: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
        })
    }

    /// Register a live-feed channel and spawn the drain task that writes
    /// the subscriber's queue to its transport. Returns the subscriber id.
    pub fn register(self: &Arc<Self>, transport: Box<dyn FeedTransport>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber::new(id));
        self.subscribers
            .write()
            .unwrap()
            .insert(id, subscriber.clone());
        subscriber.set_state(SubscriberState::Active);

        let hub = self.clone();
        tokio::spawn(drain_task(hub, subscriber, transport));

        debug!(subscriber = id, "live-feed subscriber registered");
        id
    }

    /// Remove a subscriber and close its channel. Safe to call more than
    /// once.
    pub fn unregister(&self, id: u64) {
        if let Some(subscriber) = self.subscribers.write().unwrap().remove(&id) {
            subscriber.close();
            debug!(
                subscriber = id,
                dropped = subscriber.dropped.load(Ordering::Relaxed),
                lifetime_secs = (Utc::now() - subscriber.registered_at).num_seconds(),
                "live-feed subscriber removed"
            );
        }
    }

    /// Push one stored attack to every active subscriber. The wire message
    /// is serialized once and shared across queues.
    pub fn publish(&self, attack: &EnrichedAttack) {
        let message = FeedMessage::from_attack(attack);
        let payload: Arc<str> = match serde_json::to_string(&message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("failed to serialize feed message: {e}");
                return;
            }
        };

        let snapshot: Vec<Arc<Subscriber>> = self
            .subscribers
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        let _order = self.publish_lock.lock().unwrap();
        for subscriber in snapshot {
            if subscriber.state() == SubscriberState::Active {
                subscriber.push(payload.clone(), self.queue_bound);
            }
        }
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Flush and close every subscriber channel. Used during shutdown,
    /// after in-flight ingestion has drained: anything already queued is
    /// still delivered.
    pub fn close_all(&self) {
        let mut subscribers = self.subscribers.write().unwrap();
        for (_, subscriber) in subscribers.drain() {
            subscriber.drain();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

async fn drain_task(
    hub: Arc<Broadcaster>,
    subscriber: Arc<Subscriber>,
    mut transport: Box<dyn FeedTransport>,
) {
    loop {
        let notified = subscriber.notify.notified();
        if subscriber.state() == SubscriberState::Closed {
            break;
        }
        match subscriber.pop() {
            Some(payload) => {
                if let Err(e) = transport.send(&payload).await {
                    debug!(
                        subscriber = subscriber.id,
                        "transport write failed, closing subscriber: {e}"
                    );
                    hub.unregister(subscriber.id);
                    break;
                }
            }
            // Draining means no further publishes can arrive; an empty
            // queue is final.
            None if subscriber.state() == SubscriberState::Draining => break,
            None => notified.await,
        }
    }
}
