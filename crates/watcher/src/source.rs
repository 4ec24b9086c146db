//! Boundary to the native change-notification facility
//!
//! A facility implements [`NativeEventSource`]. It receives a [`BatchSink`] when
//! subscribing and calls [`BatchSink::deliver`] from its own thread for as long
//! as the subscription lives. The sink only carries an opaque token; batches for
//! a token that has been released are dropped.

use crate::bridge;
use crate::events::RawEvent;
use fsobserver_core::{StreamConfig, SubscriptionError};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identity of one native subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Delivery target handed to the native facility
#[derive(Debug, Clone)]
pub struct BatchSink {
    token: SubscriptionToken,
}

impl BatchSink {
    pub(crate) fn new(token: SubscriptionToken) -> Self {
        Self { token }
    }

    /// Token of the subscription this sink belongs to
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// Hand an ordered batch of raw records to the observer
    ///
    /// Runs the whole decode and fan-out on the calling thread before returning.
    pub fn deliver(&self, batch: Vec<RawEvent>) {
        bridge::deliver(self.token, batch);
    }
}

/// A platform change-notification facility
pub trait NativeEventSource: Send + Sync + 'static {
    /// Handle owning one live subscription
    type Subscription: Send + 'static;

    /// Create a subscription for `paths` that delivers into `sink`
    fn subscribe(
        &self,
        paths: &[PathBuf],
        config: &StreamConfig,
        sink: BatchSink,
    ) -> Result<Self::Subscription, SubscriptionError>;

    /// Release a subscription; no batches are delivered for it afterwards
    fn unsubscribe(&self, subscription: Self::Subscription);
}
