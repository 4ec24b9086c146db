//! Multi-subscriber broadcast channel
//!
//! Each subscriber owns an unbounded queue, so a slow subscriber never stalls the
//! delivery thread or its peers. Subscribers only see events published after they
//! subscribe.

use crate::dispatcher::{DispatchStats, EventSink};
use crate::events::EventRecord;
use fsobserver_core::DeliveryFault;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) struct BroadcastHub {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<EventRecord>>>,
    stats: Arc<DispatchStats>,
}

impl BroadcastHub {
    pub(crate) fn new(stats: Arc<DispatchStats>) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            stats,
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.push(tx);
        self.stats.set_subscribers(subscribers.len());
        EventStream { rx }
    }

    fn prune(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|tx| !tx.is_closed());
        self.stats.set_subscribers(subscribers.len());
        debug!(
            removed = before - subscribers.len(),
            remaining = subscribers.len(),
            "Pruned closed broadcast subscribers"
        );
    }
}

impl EventSink for BroadcastHub {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn accept(&self, record: &EventRecord) -> Result<(), DeliveryFault> {
        let mut closed = 0usize;
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for tx in subscribers.iter() {
                if tx.send(record.clone()).is_err() {
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            self.prune();
        }
        Ok(())
    }
}

/// One subscriber's view of the broadcast channel
///
/// Ends when the observer is dropped.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventRecord>,
}

impl EventStream {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }

    /// Block the current thread until the next event
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<EventRecord> {
        self.rx.blocking_recv()
    }
}

impl Stream for EventStream {
    type Item = EventRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
