//! Single-consumer pull sequence
//!
//! The buffer is unbounded. When the backlog crosses the high-water mark a
//! warning is logged and the mark doubles, so a sustained burst warns a handful
//! of times rather than once per event.

use crate::dispatcher::EventSink;
use crate::events::EventRecord;
use fsobserver_core::DeliveryFault;
use futures::stream::FusedStream;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum SequenceState {
    /// Nobody has asked for the sequence yet; events are not buffered
    Unclaimed,
    Open {
        tx: mpsc::UnboundedSender<EventRecord>,
        pending: Arc<AtomicUsize>,
        high_water_mark: usize,
    },
    /// Terminal
    Closed,
}

pub(crate) struct SequenceSlot {
    state: Mutex<SequenceState>,
    high_water_mark: usize,
}

impl SequenceSlot {
    pub(crate) fn new(high_water_mark: usize) -> Self {
        Self {
            state: Mutex::new(SequenceState::Unclaimed),
            high_water_mark: high_water_mark.max(1),
        }
    }

    /// Hand out the sequence; only the first call succeeds
    pub(crate) fn claim(&self) -> Option<EventSequence> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, SequenceState::Unclaimed) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        *state = SequenceState::Open {
            tx,
            pending: Arc::clone(&pending),
            high_water_mark: self.high_water_mark,
        };
        Some(EventSequence {
            rx,
            pending,
            terminated: false,
        })
    }

    /// Close an open sequence; the consumer drains the backlog and then ends
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let SequenceState::Open { pending, .. } = &*state {
            debug!(
                buffered = pending.load(Ordering::Relaxed),
                "Closing pull sequence"
            );
            *state = SequenceState::Closed;
        }
    }
}

impl EventSink for SequenceSlot {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn accept(&self, record: &EventRecord) -> Result<(), DeliveryFault> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let SequenceState::Open {
            tx,
            pending,
            high_water_mark,
        } = &mut *state
        else {
            return Ok(());
        };

        if tx.send(record.clone()).is_err() {
            debug!("Pull sequence consumer dropped; closing");
            *state = SequenceState::Closed;
            return Ok(());
        }

        let buffered = pending.fetch_add(1, Ordering::AcqRel) + 1;
        if buffered > *high_water_mark {
            warn!(
                buffered,
                high_water_mark = *high_water_mark,
                "Pull sequence backlog above high-water mark"
            );
            *high_water_mark = high_water_mark.saturating_mul(2);
        }
        Ok(())
    }
}

/// Pull-based view of the observer's events
///
/// Yields events in delivery order until the observer stops, then yields `None`.
/// A closed sequence never produces another event.
#[derive(Debug)]
pub struct EventSequence {
    rx: mpsc::UnboundedReceiver<EventRecord>,
    pending: Arc<AtomicUsize>,
    terminated: bool,
}

impl EventSequence {
    /// Wait for the next event, or `None` once the sequence is closed
    pub async fn recv(&mut self) -> Option<EventRecord> {
        if self.terminated {
            return None;
        }
        let next = self.rx.recv().await;
        self.observe(next)
    }

    /// Block the current thread until the next event or closure
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<EventRecord> {
        if self.terminated {
            return None;
        }
        let next = self.rx.blocking_recv();
        self.observe(next)
    }

    /// Number of events buffered and not yet pulled
    pub fn backlog(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once end-of-sequence has been returned
    pub fn is_closed(&self) -> bool {
        self.terminated
    }

    fn observe(&mut self, next: Option<EventRecord>) -> Option<EventRecord> {
        match next {
            Some(record) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Some(record)
            }
            None => {
                self.terminated = true;
                None
            }
        }
    }
}

impl Stream for EventSequence {
    type Item = EventRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(next) => Poll::Ready(self.observe(next)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedStream for EventSequence {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
