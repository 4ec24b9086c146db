//! Fan-out of decoded events to consumer channels
//!
//! The dispatcher is a single broadcast point with three sink kinds, visited in
//! a fixed order for every event: callback, then broadcast subscribers, then the
//! pull sequence. Delivery is synchronous on the native delivery thread and never
//! blocks: every queue behind it is unbounded.

use crate::broadcast::{BroadcastHub, EventStream};
use crate::events::EventRecord;
use crate::sequence::{EventSequence, SequenceSlot};
use fsobserver_core::DeliveryFault;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Synchronous event handler
pub type Callback = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// A consumer channel the dispatcher delivers into
pub(crate) trait EventSink: Send + Sync {
    /// Channel name used in diagnostics
    fn name(&self) -> &'static str;

    /// Accept one event without blocking
    fn accept(&self, record: &EventRecord) -> Result<(), DeliveryFault>;
}

/// Point-in-time observer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverStats {
    /// Native batches received
    pub batches_received: u64,
    /// Events fanned out to the channels
    pub events_dispatched: u64,
    /// Events discarded because delivery was stopped mid-batch
    pub events_dropped: u64,
    /// Callback invocations that panicked
    pub callback_faults: u64,
    /// Live broadcast subscribers
    pub broadcast_subscribers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    batches: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    faults: AtomicU64,
    last_id: AtomicU64,
    has_last_id: AtomicBool,
    subscribers: AtomicUsize,
}

impl DispatchStats {
    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_subscribers(&self, count: usize) {
        self.subscribers.store(count, Ordering::Relaxed);
    }

    fn record_dispatched(&self, id: u64) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.last_id.store(id, Ordering::Release);
        self.has_last_id.store(true, Ordering::Release);
    }

    fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn last_event_id(&self) -> Option<u64> {
        self.has_last_id
            .load(Ordering::Acquire)
            .then(|| self.last_id.load(Ordering::Acquire))
    }

    pub(crate) fn snapshot(&self) -> ObserverStats {
        ObserverStats {
            batches_received: self.batches.load(Ordering::Relaxed),
            events_dispatched: self.dispatched.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            callback_faults: self.faults.load(Ordering::Relaxed),
            broadcast_subscribers: self.subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Single-slot callback channel
#[derive(Default)]
pub(crate) struct CallbackSlot {
    handler: RwLock<Option<Callback>>,
}

impl CallbackSlot {
    fn set(&self, callback: Option<Callback>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn is_set(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl EventSink for CallbackSlot {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn accept(&self, record: &EventRecord) -> Result<(), DeliveryFault> {
        // Call outside the lock so the handler may replace itself.
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return Ok(());
        };
        panic::catch_unwind(AssertUnwindSafe(|| handler(record)))
            .map_err(|payload| DeliveryFault::CallbackPanicked(panic_message(payload.as_ref())))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fans every event out to the callback, broadcast and pull-sequence channels
pub(crate) struct Dispatcher {
    callback: CallbackSlot,
    broadcast: BroadcastHub,
    sequence: SequenceSlot,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub(crate) fn new(sequence_high_water_mark: usize) -> Self {
        let stats = Arc::new(DispatchStats::default());
        Self {
            callback: CallbackSlot::default(),
            broadcast: BroadcastHub::new(Arc::clone(&stats)),
            sequence: SequenceSlot::new(sequence_high_water_mark),
            stats,
        }
    }

    pub(crate) fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    fn sinks(&self) -> [&dyn EventSink; 3] {
        [&self.callback, &self.broadcast, &self.sequence]
    }

    /// Deliver one event to every channel, in channel order
    ///
    /// Once `closed` is set the event goes no further than the channel being
    /// served, so a stop issued from the callback reaches neither the broadcast
    /// subscribers nor the pull sequence.
    pub(crate) fn dispatch(&self, record: &EventRecord, closed: &AtomicBool) {
        for sink in self.sinks() {
            if let Err(fault) = sink.accept(record) {
                self.stats.record_fault();
                error!(
                    channel = sink.name(),
                    event_id = record.id(),
                    path = %record.path().display(),
                    "Channel delivery fault: {fault}"
                );
            }
            if closed.load(Ordering::Acquire) {
                debug!(
                    channel = sink.name(),
                    event_id = record.id(),
                    "Delivery closed mid-event; skipping remaining channels"
                );
                break;
            }
        }
        self.stats.record_dispatched(record.id());
    }

    pub(crate) fn set_callback(&self, callback: Callback) {
        self.callback.set(Some(callback));
    }

    pub(crate) fn clear_callback(&self) {
        self.callback.set(None);
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.is_set()
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        self.broadcast.subscribe()
    }

    pub(crate) fn claim_sequence(&self) -> Option<EventSequence> {
        self.sequence.claim()
    }

    pub(crate) fn close_sequence(&self) {
        self.sequence.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawEvent;
    use fsobserver_core::FlagSet;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn open() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn record(id: u64) -> EventRecord {
        EventRecord::decode(RawEvent::new(
            "/tmp/watched/a.txt",
            FlagSet::ITEM_CREATED | FlagSet::ITEM_IS_FILE,
            id,
        ))
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_channel_once() {
        let dispatcher = Dispatcher::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.set_callback(Arc::new(move |r: &EventRecord| {
            sink.lock().unwrap().push(r.clone());
        }));
        let mut first = dispatcher.subscribe();
        let mut second = dispatcher.subscribe();
        let mut sequence = dispatcher.claim_sequence().unwrap();

        let event = record(1);
        dispatcher.dispatch(&event, &open());

        assert_eq!(*seen.lock().unwrap(), vec![event.clone()]);
        assert_eq!(first.recv().await, Some(event.clone()));
        assert_eq!(second.recv().await, Some(event.clone()));
        assert_eq!(sequence.recv().await, Some(event));
        assert!(first.try_recv().is_none());
        assert!(second.try_recv().is_none());
        assert_eq!(dispatcher.stats().snapshot().events_dispatched, 1);
        assert_eq!(dispatcher.stats().last_event_id(), Some(1));
    }

    #[tokio::test]
    async fn test_callback_panic_is_contained() {
        let dispatcher = Dispatcher::new(16);
        dispatcher.set_callback(Arc::new(|_: &EventRecord| panic!("handler exploded")));
        let mut stream = dispatcher.subscribe();

        dispatcher.dispatch(&record(7), &open());

        assert_eq!(stream.recv().await.map(|r| r.id()), Some(7));
        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.callback_faults, 1);
        assert_eq!(stats.events_dispatched, 1);
    }

    #[test]
    fn test_callback_can_be_replaced_and_cleared() {
        let dispatcher = Dispatcher::new(16);
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        dispatcher.set_callback(Arc::new(move |_: &EventRecord| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(dispatcher.has_callback());
        dispatcher.dispatch(&record(1), &open());
        dispatcher.clear_callback();
        assert!(!dispatcher.has_callback());
        dispatcher.dispatch(&record(2), &open());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closing_from_callback_cuts_remaining_channels() {
        let dispatcher = Dispatcher::new(16);
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        dispatcher.set_callback(Arc::new(move |_: &EventRecord| {
            flag.store(true, Ordering::Release);
        }));
        let mut stream = dispatcher.subscribe();
        let mut sequence = dispatcher.claim_sequence().unwrap();

        dispatcher.dispatch(&record(3), &closed);

        assert!(stream.try_recv().is_none());
        assert_eq!(sequence.backlog(), 0);
        dispatcher.close_sequence();
        assert_eq!(sequence.recv().await, None);
    }

    #[test]
    fn test_no_last_id_before_dispatch() {
        let dispatcher = Dispatcher::new(16);
        assert_eq!(dispatcher.stats().last_event_id(), None);
        assert_eq!(dispatcher.stats().snapshot(), ObserverStats::default());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
