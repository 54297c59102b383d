//! # kiln-events: Event bus for `Kiln`
//!
//! Typed publish/subscribe fan-out with a bounded in-memory history.
//!
//! Delivery is synchronous on the publisher's thread: a slow subscriber
//! therefore throttles publishing, but ordering is trivially preserved —
//! events published in sequence by one publisher arrive in sequence at
//! every subscriber. A panicking subscriber is isolated and never
//! prevents delivery to the remaining subscribers.
//!
//! History is bounded; overflow drops the oldest entries and counts them.
//!
//! ```
//! use kiln_events::EventBus;
//! use kiln_types::{Event, EventType, Metadata};
//!
//! let bus = EventBus::new();
//! let _sub = bus.subscribe(Some(EventType::JobSubmitted), |event| {
//!     println!("job submitted: {:?}", event.data.get("job_id"));
//! });
//! bus.publish(Event::new(EventType::JobSubmitted, Metadata::new(), "example"));
//! assert_eq!(bus.recent_events(10).len(), 1);
//! ```

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kiln_types::{Event, EventType};

/// Maximum number of events retained in the history ring.
pub const HISTORY_CAPACITY: usize = 1000;

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` subscribes to every event type.
    filter: Option<EventType>,
    callback: Callback,
}

struct BusState {
    subscribers: Vec<Subscriber>,
    history: VecDeque<Event>,
    dropped: u64,
}

/// Handle returned by [`EventBus::subscribe`]; pass back to
/// [`EventBus::unsubscribe`] to remove the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Synchronous fan-out event bus with bounded history.
///
/// Cheap to clone; clones share the same subscriber list and history.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                dropped: 0,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a subscriber for `filter` events (`None` = all events).
    pub fn subscribe<F>(&self, filter: Option<EventType>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("event bus lock poisoned");
        state.subscribers.push(Subscriber {
            id,
            filter,
            callback: Arc::new(callback),
        });
        SubscriptionId(id)
    }

    /// Removes a subscription. Unknown IDs are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        state.subscribers.retain(|s| s.id != id.0);
    }

    /// Publishes an event to every matching subscriber and appends it to
    /// the history ring.
    ///
    /// Delivery is best-effort: a panicking subscriber is logged and
    /// skipped. Returns the number of subscribers that received the event.
    pub fn publish(&self, event: Event) -> usize {
        // Copy the callbacks out so no lock is held during delivery —
        // subscribers may publish follow-up events.
        let callbacks: Vec<Callback> = {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            if state.history.len() == HISTORY_CAPACITY {
                state.history.pop_front();
                state.dropped += 1;
            }
            state.history.push_back(event.clone());

            state
                .subscribers
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(event.event_type))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        let mut delivered = 0;
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&event)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        event_type = %event.event_type,
                        "event subscriber panicked; continuing delivery"
                    );
                }
            }
        }
        delivered
    }

    /// Returns up to `limit` most recent events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let state = self.state.lock().expect("event bus lock poisoned");
        let start = state.history.len().saturating_sub(limit);
        state.history.iter().skip(start).cloned().collect()
    }

    /// Number of events evicted from the history ring so far.
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().expect("event bus lock poisoned").dropped
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .expect("event bus lock poisoned")
            .subscribers
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}
