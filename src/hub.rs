//! Telemetry fan-out
//!
//! The hub routes one-second samples to attached subscribers by topic and
//! rule filter. Delivery is strictly non-blocking for publishers: each
//! subscriber has a bounded inbox, and a subscriber whose inbox is full is
//! evicted so the data plane never waits on a slow observer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Topic carrying per-flow connection lists
pub const TOPIC_CONNECTIONS: &str = "relay.connections";

/// Topic carrying per-rule traffic totals and rates
pub const TOPIC_TRAFFIC: &str = "relay.traffic";

/// Default per-subscriber inbox capacity
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Capability for pushing samples out of the engine
///
/// The sampler depends on this one method, not on the concrete hub.
pub trait Broadcaster: Send + Sync {
    /// Deliver a sample for one rule to whoever is listening
    fn broadcast_to_relay(&self, relay_id: &str, topic: &str, payload: Value);
}

/// Broadcaster that discards everything
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast_to_relay(&self, _relay_id: &str, _topic: &str, _payload: Value) {}
}

/// One routed sample
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    /// Topic name
    pub topic: String,
    /// Rule the sample belongs to; empty for rule-agnostic broadcasts
    pub relay_id: String,
    /// Sample payload
    pub payload: Value,
}

/// Per-subscriber topic and rule filter
#[derive(Debug, Default)]
struct SubscriberFilter {
    topics: HashSet<String>,
    relay_id: String,
}

impl SubscriberFilter {
    /// Topic must be subscribed; the rule filter matches everything when empty
    fn matches(&self, topic: &str, relay_id: &str) -> bool {
        self.topics.contains(topic) && (self.relay_id.is_empty() || self.relay_id == relay_id)
    }

    fn matches_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }
}

struct SubscriberEntry {
    sender: mpsc::Sender<Arc<TelemetryEvent>>,
    filter: Arc<Mutex<SubscriberFilter>>,
}

/// Receiving end of a hub attachment
///
/// Dropping the handle ends the subscription; the hub notices the closed
/// inbox on its next publish and discards the entry.
pub struct SubscriberHandle {
    id: u64,
    receiver: mpsc::Receiver<Arc<TelemetryEvent>>,
    filter: Arc<Mutex<SubscriberFilter>>,
}

impl SubscriberHandle {
    /// Subscriber id, for explicit detach
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next matching sample
    ///
    /// Returns `None` once the hub has evicted or detached this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<TelemetryEvent>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Arc<TelemetryEvent>> {
        self.receiver.try_recv().ok()
    }

    /// Add topics to the filter and set the rule filter
    ///
    /// An empty `relay_id` matches samples from every rule.
    pub fn subscribe<I, S>(&self, topics: I, relay_id: impl Into<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter = self.filter.lock();
        for topic in topics {
            filter.topics.insert(topic.into());
        }
        filter.relay_id = relay_id.into();
    }

    /// Remove topics from the filter
    pub fn unsubscribe<'a, I>(&self, topics: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut filter = self.filter.lock();
        for topic in topics {
            filter.topics.remove(topic);
        }
    }
}

/// Fan-out hub for engine telemetry
pub struct TelemetryHub {
    subscribers: RwLock<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    inbox_capacity: usize,
    evicted: AtomicU64,
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryHub {
    /// Create a hub with the default inbox capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    /// Create a hub with a custom per-subscriber inbox capacity
    #[must_use]
    pub fn with_capacity(inbox_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbox_capacity: inbox_capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    /// Attach a subscriber with an empty filter
    ///
    /// The subscriber receives nothing until it subscribes to topics.
    #[must_use]
    pub fn attach(&self) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inbox_capacity);
        let filter = Arc::new(Mutex::new(SubscriberFilter::default()));

        self.subscribers.write().insert(
            id,
            SubscriberEntry {
                sender,
                filter: Arc::clone(&filter),
            },
        );

        SubscriberHandle {
            id,
            receiver,
            filter,
        }
    }

    /// Remove a subscriber explicitly
    pub fn detach(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    /// Current subscriber count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Total subscribers evicted for falling behind
    #[must_use]
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Broadcast a rule-agnostic sample, filtered by topic only
    pub fn broadcast(&self, topic: &str, payload: Value) {
        self.deliver(
            Arc::new(TelemetryEvent {
                topic: topic.to_string(),
                relay_id: String::new(),
                payload,
            }),
            false,
        );
    }

    /// Route an event to every subscriber whose filter matches
    ///
    /// Publishers never block: a full inbox marks the subscriber slow, and
    /// slow subscribers are evicted after the delivery pass.
    fn deliver(&self, event: Arc<TelemetryEvent>, apply_relay_filter: bool) {
        let mut stale: Vec<(u64, bool)> = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, entry) in subscribers.iter() {
                let matched = {
                    let filter = entry.filter.lock();
                    if apply_relay_filter {
                        filter.matches(&event.topic, &event.relay_id)
                    } else {
                        filter.matches_topic(&event.topic)
                    }
                };
                if !matched {
                    continue;
                }
                match entry.sender.try_send(Arc::clone(&event)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => stale.push((*id, true)),
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push((*id, false)),
                }
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.subscribers.write();
            for (id, slow) in stale {
                if subscribers.remove(&id).is_some() && slow {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = id, "Evicted slow subscriber");
                }
            }
        }
    }
}

impl Broadcaster for TelemetryHub {
    fn broadcast_to_relay(&self, relay_id: &str, topic: &str, payload: Value) {
        self.deliver(
            Arc::new(TelemetryEvent {
                topic: topic.to_string(),
                relay_id: relay_id.to_string(),
                payload,
            }),
            true,
        );
    }
}
