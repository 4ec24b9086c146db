//! Decode path between the native facility and the dispatcher
//!
//! Every running subscription has a [`Bridge`] stored in a process-wide registry
//! keyed by [`SubscriptionToken`]. The registry holds the strong reference while
//! the subscription runs; the native side only ever sees the token.

use crate::dispatcher::Dispatcher;
use crate::events::{EventRecord, RawEvent};
use crate::source::SubscriptionToken;
use dashmap::DashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::{debug, trace};

static REGISTRY: LazyLock<DashMap<SubscriptionToken, Arc<Bridge>>> = LazyLock::new(DashMap::new);

thread_local! {
    /// Subscriptions currently delivering on this thread
    static DELIVERING: RefCell<Vec<SubscriptionToken>> = const { RefCell::new(Vec::new()) };
}

/// Per-subscription decode and delivery gate
pub(crate) struct Bridge {
    token: SubscriptionToken,
    dispatcher: Arc<Dispatcher>,
    /// Set once; checked before every record
    closed: AtomicBool,
    /// Held shared by each batch in flight, exclusively by `close`
    in_flight: RwLock<()>,
}

impl Bridge {
    pub(crate) fn new(token: SubscriptionToken, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            token,
            dispatcher,
            closed: AtomicBool::new(false),
            in_flight: RwLock::new(()),
        }
    }

    pub(crate) fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// Decode and dispatch one batch in order
    fn on_batch(&self, batch: Vec<RawEvent>) {
        let _in_flight = self.in_flight.read().unwrap_or_else(PoisonError::into_inner);
        let _scope = DeliveryScope::enter(self.token);

        let total = batch.len();
        if self.closed.load(Ordering::Acquire) {
            self.dispatcher.stats().record_dropped(total);
            debug!(subscription = %self.token, dropped = total, "Dropping batch after stop");
            return;
        }
        self.dispatcher.stats().record_batch();
        debug!(subscription = %self.token, events = total, "Received native batch");

        for (index, raw) in batch.into_iter().enumerate() {
            if self.closed.load(Ordering::Acquire) {
                let dropped = total - index;
                self.dispatcher.stats().record_dropped(dropped);
                debug!(
                    subscription = %self.token,
                    dropped,
                    "Dropping remainder of batch after stop"
                );
                return;
            }
            let record = EventRecord::decode(raw);
            trace!(subscription = %self.token, %record, "Dispatching event");
            self.dispatcher.dispatch(&record, &self.closed);
        }
    }

    /// Stop delivery
    ///
    /// Waits for a batch in flight on another thread to reach a channel boundary.
    /// Called from inside this subscription's own delivery, it returns at once and
    /// the current record goes no further than the channel being served.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if is_delivering(self.token) {
            debug!(subscription = %self.token, "Closed from its own delivery thread");
            return;
        }
        drop(self.in_flight.write().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Marks the current thread as delivering for one subscription
struct DeliveryScope;

impl DeliveryScope {
    fn enter(token: SubscriptionToken) -> Self {
        DELIVERING.with(|stack| stack.borrow_mut().push(token));
        Self
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// True if the calling thread is inside a delivery for `token`
pub(crate) fn is_delivering(token: SubscriptionToken) -> bool {
    DELIVERING.with(|stack| stack.borrow().contains(&token))
}

pub(crate) fn register(bridge: Arc<Bridge>) {
    REGISTRY.insert(bridge.token(), bridge);
}

pub(crate) fn unregister(token: SubscriptionToken) -> Option<Arc<Bridge>> {
    REGISTRY.remove(&token).map(|(_, bridge)| bridge)
}

/// Close delivery for `token` without waiting for the batch in flight
///
/// Only meaningful on the subscription's own delivery thread, where `close`
/// never waits.
pub(crate) fn close_from_delivery(token: SubscriptionToken) {
    let bridge = REGISTRY.get(&token).map(|entry| Arc::clone(entry.value()));
    if let Some(bridge) = bridge {
        bridge.close();
    }
}

#[cfg(test)]
pub(crate) fn is_registered(token: SubscriptionToken) -> bool {
    REGISTRY.contains_key(&token)
}

/// Route a native batch to the bridge registered for `token`
pub(crate) fn deliver(token: SubscriptionToken, batch: Vec<RawEvent>) {
    // Clone out so the shard lock is not held while consumers run.
    let bridge = REGISTRY.get(&token).map(|entry| Arc::clone(entry.value()));
    match bridge {
        Some(bridge) => bridge.on_batch(batch),
        None => trace!(
            subscription = %token,
            events = batch.len(),
            "Batch for released subscription dropped"
        ),
    }
}
