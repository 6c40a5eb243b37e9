//! Serve path: best-effort fan-out to live subscribers
//!
//! Each subscriber owns a bounded queue. Publishing never waits: when a
//! queue is full its oldest update is dropped to make room, the drop is
//! counted as `SubscriberBackpressure`, and every other subscriber is
//! unaffected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use feed_types::errors::Diagnostic;
use feed_types::ids::{InstrumentId, SubscriptionId};
use feed_types::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::CandleUpdate;
use crate::config::ConfigError;
use crate::metrics::EngineMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub enabled: bool,
    /// Updates held per subscriber before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 1_024,
        }
    }
}

impl ServeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("serve.queue_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<CandleUpdate>>,
    dropped: u64,
    closed: bool,
}

/// Bounded single-consumer queue with drop-oldest overflow.
#[derive(Debug)]
pub struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1_024)),
                ..Default::default()
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue `update`; returns true if the oldest queued update was dropped.
    pub fn push(&self, update: Arc<CandleUpdate>) -> bool {
        let dropped = {
            let mut state = lock(&self.state);
            if state.closed {
                return false;
            }
            let dropped = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.items.push_back(update);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<Arc<CandleUpdate>> {
        lock(&self.state).items.pop_front()
    }

    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }
}

type SubscriberKey = (InstrumentId, Timeframe);

struct HubInner {
    config: ServeConfig,
    metrics: Arc<EngineMetrics>,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberKey, Vec<(SubscriptionId, Arc<SubscriberQueue>)>>>,
}

impl HubInner {
    fn remove(&self, key: &SubscriberKey, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let Some(list) = subscribers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, queue)| {
            if *sid == id {
                queue.close();
            }
            *sid != id
        });
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(key);
        }
        removed
    }
}

/// Subscriber registry keyed by (instrument, timeframe). Cheap to clone.
#[derive(Clone)]
pub struct ServeHub {
    inner: Arc<HubInner>,
}

impl ServeHub {
    pub fn new(config: ServeConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                metrics,
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn subscribe(&self, instrument_id: InstrumentId, timeframe: Timeframe) -> Subscription {
        let id = SubscriptionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SubscriberQueue::new(self.inner.config.queue_capacity));
        let key = (instrument_id, timeframe);
        if !self.inner.config.enabled {
            // Nothing will ever be published.
            queue.close();
        } else {
            lock(&self.inner.subscribers)
                .entry(key.clone())
                .or_default()
                .push((id, queue.clone()));
        }
        debug!(subscription = %id, instrument = %key.0, timeframe = %key.1, "Subscriber added");
        Subscription {
            id,
            key,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription by id. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.remove(&subscription.key, subscription.id)
    }

    /// Deliver `update` to every subscriber of its (instrument, timeframe).
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, update: CandleUpdate) -> usize {
        if !self.inner.config.enabled {
            return 0;
        }
        let key = (update.candle.instrument_id.clone(), update.candle.timeframe);
        let queues: Vec<(SubscriptionId, Arc<SubscriberQueue>)> = match lock(&self.inner.subscribers).get(&key) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let update = Arc::new(update);
        for (id, queue) in &queues {
            if queue.push(update.clone()) {
                self.inner.metrics.record(Diagnostic::SubscriberBackpressure);
                warn!(
                    subscription = %id,
                    instrument = %key.0,
                    timeframe = %key.1,
                    dropped = queue.dropped(),
                    "Subscriber queue full, dropped oldest update"
                );
            }
        }
        queues.len()
    }

    pub fn subscriber_count(&self, instrument_id: &InstrumentId, timeframe: Timeframe) -> usize {
        lock(&self.inner.subscribers)
            .get(&(instrument_id.clone(), timeframe))
            .map_or(0, Vec::len)
    }

    /// Close every queue; pending updates stay readable, then `recv` returns `None`.
    pub fn close(&self) {
        let drained: Vec<_> = lock(&self.inner.subscribers).drain().collect();
        for (_, list) in drained {
            for (_, queue) in list {
                queue.close();
            }
        }
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    key: SubscriberKey,
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn instrument_id(&self) -> &InstrumentId {
        &self.key.0
    }

    pub fn timeframe(&self) -> Timeframe {
        self.key.1
    }

    /// Next update, waiting if none is queued. `None` once the hub closed the
    /// subscription and the queue is drained.
    pub async fn recv(&self) -> Option<Arc<CandleUpdate>> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(update) = self.queue.pop() {
                return Some(update);
            }
            if self.queue.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<Arc<CandleUpdate>> {
        self.queue.pop()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Updates dropped for this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.key, self.id);
        }
    }
}
