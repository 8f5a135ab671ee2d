//! Server-push event bus with credit-based backpressure.
//!
//! Topics are `|`-delimited segment strings; subscription patterns may use
//! `*` as a per-segment wildcard. Each subscription holds a FIFO queue of
//! matched events and a credit counter: events are delivered only while
//! credit is positive, and credit only increases when the subscriber asks
//! for more via [`Subscription::request`]. Undelivered events age out of the
//! queue once they exceed the bus retention window.
//!
//! Delivery order within one subscription follows arrival order. At most one
//! delivery task per subscription is in flight on the worker pool at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minstant::Instant;
use serde_json::Value;

use crate::error::Error;
use crate::trace::{debug, trace};
use crate::worker::WorkerPool;

/// Segment delimiter in topics and patterns.
pub const TOPIC_DELIMITER: char = '|';

/// Per-segment wildcard in patterns.
pub const TOPIC_WILDCARD: &str = "*";

/// Consumer of events matched by a subscription pattern.
pub trait EventSubscriber: Send + Sync {
    /// Called with each delivered event payload, in arrival order.
    fn on_next(&self, payload: Value);
    /// Called when a matched event decomposes into an error, for example a
    /// synthetic connection-failure event.
    fn on_error(&self, error: Error);
    /// Called once when the subscription is cancelled.
    fn on_complete(&self);
}

struct Event {
    payload: Value,
    arrived: Instant,
}

struct HolderState {
    queue: VecDeque<Event>,
    credit: u64,
}

struct Holder {
    subscriber: Arc<dyn EventSubscriber>,
    segments: Vec<String>,
    state: Mutex<HolderState>,
    // one in-flight delivery task per subscription
    busy: AtomicBool,
    cancelled: AtomicBool,
}

impl Holder {
    fn matches(&self, topic: &str) -> bool {
        let mut topic_segments = topic.split(TOPIC_DELIMITER);
        for pattern in &self.segments {
            let Some(segment) = topic_segments.next() else {
                return false;
            };
            if pattern != TOPIC_WILDCARD && pattern != segment {
                return false;
            }
        }
        topic_segments.next().is_none()
    }
}

struct BusInner {
    holders: Mutex<Vec<Arc<Holder>>>,
    pool: Arc<WorkerPool>,
    retention: Duration,
}

/// Fan-out point for server-pushed notifications.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus delivering on `pool` and retaining undelivered events
    /// for `retention`.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, retention: Duration) -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                holders: Mutex::new(Vec::new()),
                pool,
                retention,
            }),
        }
    }

    /// Registers `subscriber` under `pattern`. The subscription starts with
    /// zero credit; nothing is delivered until [`Subscription::request`].
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Subscription {
        let pattern = pattern.into();
        let holder = Arc::new(Holder {
            subscriber,
            segments: pattern.split(TOPIC_DELIMITER).map(str::to_owned).collect(),
            state: Mutex::new(HolderState {
                queue: VecDeque::new(),
                credit: 0,
            }),
            busy: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        self.inner
            .holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&holder));
        Subscription {
            bus: Arc::clone(&self.inner),
            holder,
        }
    }

    /// Queues `payload` on every subscription whose pattern matches `topic`
    /// and schedules delivery where credit allows.
    pub fn publish(&self, topic: &str, payload: Value) {
        let now = Instant::now();
        let holders: Vec<Arc<Holder>> = self
            .inner
            .holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.matches(topic))
            .cloned()
            .collect();
        if holders.is_empty() {
            trace!(topic, "event matched no subscriptions");
            return;
        }
        for holder in holders {
            {
                let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
                state.queue.push_back(Event {
                    payload: payload.clone(),
                    arrived: now,
                });
            }
            self.schedule_delivery(&holder);
        }
    }

    /// Drops queued events older than the retention window from every
    /// subscription. Only undelivered events age out.
    pub fn purge_now(&self) {
        let now = Instant::now();
        let retention = self.inner.retention;
        let holders = self
            .inner
            .holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for holder in holders {
            let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
            let before = state.queue.len();
            while let Some(front) = state.queue.front() {
                if now.duration_since(front.arrived) > retention {
                    state.queue.pop_front();
                } else {
                    break;
                }
            }
            let dropped = before - state.queue.len();
            if dropped > 0 {
                debug!(dropped, "purged stale events");
            }
        }
    }

    /// Number of queued, undelivered events across subscriptions matching
    /// `topic`.
    #[must_use]
    pub fn queued_events(&self, topic: &str) -> usize {
        self.inner
            .holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.matches(topic))
            .map(|h| h.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len())
            .sum()
    }

    fn schedule_delivery(&self, holder: &Arc<Holder>) {
        schedule_delivery(&self.inner, holder);
    }
}

fn schedule_delivery(bus: &Arc<BusInner>, holder: &Arc<Holder>) {
    if holder.busy.swap(true, Ordering::AcqRel) {
        return;
    }
    let bus = Arc::clone(bus);
    let holder = Arc::clone(holder);
    bus.pool.clone().execute(move || {
        loop {
            if holder.cancelled.load(Ordering::Acquire) {
                break;
            }
            let payload = {
                let mut state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.credit == 0 || state.queue.is_empty() {
                    break;
                }
                state.credit -= 1;
                match state.queue.pop_front() {
                    Some(event) => event.payload,
                    None => break,
                }
            };
            dispatch(&holder, payload);
        }
        holder.busy.store(false, Ordering::Release);
        // Re-check: credit or events may have arrived while we were busy.
        let rerun = {
            let state = holder.state.lock().unwrap_or_else(|e| e.into_inner());
            state.credit > 0 && !state.queue.is_empty()
        };
        if rerun && !holder.cancelled.load(Ordering::Acquire) {
            schedule_delivery(&bus, &holder);
        }
    });
}

/// Hands an event to the subscriber, decomposing synthetic error payloads.
fn dispatch(holder: &Holder, payload: Value) {
    match payload.as_object() {
        Some(obj) => {
            if let Some(message) = obj.get("error").and_then(Value::as_str) {
                holder
                    .subscriber
                    .on_error(Error::Connection(message.to_owned()));
            } else {
                holder.subscriber.on_next(payload);
            }
        }
        None => debug!("dropping non-object event payload"),
    }
}

/// Handle to an active subscription.
pub struct Subscription {
    bus: Arc<BusInner>,
    holder: Arc<Holder>,
}

impl Subscription {
    /// Grants `n` more deliveries. Credit never decreases except by
    /// delivery.
    pub fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        {
            let mut state = self.holder.state.lock().unwrap_or_else(|e| e.into_inner());
            state.credit = state.credit.saturating_add(n);
        }
        schedule_delivery(&self.bus, &self.holder);
    }

    /// Remaining credit.
    #[must_use]
    pub fn credit(&self) -> u64 {
        self.holder
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .credit
    }

    /// Cancels the subscription: drops queued events, removes the holder
    /// from the bus, and calls `on_complete` exactly once.
    pub fn cancel(&self) {
        if self.holder.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut holders = self.bus.holders.lock().unwrap_or_else(|e| e.into_inner());
            holders.retain(|h| !Arc::ptr_eq(h, &self.holder));
        }
        self.holder
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .clear();
        self.holder.subscriber.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;

    struct Recorder {
        received: StdMutex<Vec<Value>>,
        errors: AtomicUsize,
        completed: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                received: StdMutex::new(Vec::new()),
                errors: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }

        fn wait_for(&self, n: usize) -> Vec<Value> {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            loop {
                let got = self.received.lock().unwrap().clone();
                if got.len() >= n || std::time::Instant::now() >= deadline {
                    return got;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl EventSubscriber for Recorder {
        fn on_next(&self, payload: Value) {
            self.received.lock().unwrap().push(payload);
        }
        fn on_error(&self, _error: Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_complete(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn bus(retention: Duration) -> EventBus {
        EventBus::new(Arc::new(WorkerPool::new(2)), retention)
    }

    #[test]
    fn no_delivery_without_credit() {
        let bus = bus(Duration::from_secs(60));
        let rec = Recorder::new();
        let _sub = bus.subscribe("host|a|b|c", rec.clone());
        bus.publish("host|a|b|c", json!({"n": 1}));
        std::thread::sleep(Duration::from_millis(50));
        assert!(rec.received.lock().unwrap().is_empty());
        assert_eq!(bus.queued_events("host|a|b|c"), 1);
    }

    #[test]
    fn credit_grants_delivery_in_arrival_order() {
        let bus = bus(Duration::from_secs(60));
        let rec = Recorder::new();
        let sub = bus.subscribe("host|*|*|*", rec.clone());
        bus.publish("host|a|b|c", json!({"n": 1}));
        bus.publish("host|x|y|z", json!({"n": 2}));
        bus.publish("host|x|y|z", json!({"n": 3}));
        sub.request(2);
        let got = rec.wait_for(2);
        assert_eq!(got, vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(sub.credit(), 0);
        assert_eq!(bus.queued_events("host|x|y|z"), 1);
    }

    #[test]
    fn wildcard_matches_per_segment() {
        let bus = bus(Duration::from_secs(60));
        let rec = Recorder::new();
        let sub = bus.subscribe("host|*|events|*", rec.clone());
        sub.request(10);
        bus.publish("host|vm|events|status", json!({"hit": 1}));
        bus.publish("host|vm|other|status", json!({"miss": 1}));
        bus.publish("host|vm|events", json!({"miss": 2}));
        let got = rec.wait_for(1);
        assert_eq!(got, vec![json!({"hit": 1})]);
    }

    #[test]
    fn error_payload_routes_to_on_error() {
        let bus = bus(Duration::from_secs(60));
        let rec = Recorder::new();
        let sub = bus.subscribe("host|*|*|*", rec.clone());
        sub.request(1);
        bus.publish("host|*|*|*", json!({"error": "connection lost"}));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rec.errors.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rec.errors.load(Ordering::SeqCst), 1);
        assert!(rec.received.lock().unwrap().is_empty());
    }

    #[test]
    fn purge_drops_only_stale_events() {
        let bus = bus(Duration::from_millis(80));
        let rec = Recorder::new();
        let _sub = bus.subscribe("t|1", rec.clone());
        for n in 0..5 {
            bus.publish("t|1", json!({"stale": n}));
        }
        std::thread::sleep(Duration::from_millis(120));
        for n in 0..2 {
            bus.publish("t|1", json!({"fresh": n}));
        }
        bus.purge_now();
        assert_eq!(bus.queued_events("t|1"), 2);
    }

    #[test]
    fn cancel_completes_once_and_clears_queue() {
        let bus = bus(Duration::from_secs(60));
        let rec = Recorder::new();
        let sub = bus.subscribe("t|1", rec.clone());
        bus.publish("t|1", json!({"n": 1}));
        sub.cancel();
        sub.cancel();
        assert_eq!(rec.completed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.queued_events("t|1"), 0);
        bus.publish("t|1", json!({"n": 2}));
        assert_eq!(bus.queued_events("t|1"), 0);
    }
}
