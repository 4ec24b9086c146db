//! Hand-driven native source for tests
//!
//! [`ManualEventSource`] records every subscription and lets a test push raw
//! batches. Batches are delivered from a freshly spawned thread, the way a real
//! facility calls in from its own delivery thread.

use crate::events::RawEvent;
use crate::source::{BatchSink, NativeEventSource, SubscriptionToken};
use fsobserver_core::{StreamConfig, SubscriptionError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

/// What the source knows about one subscription
#[derive(Debug, Clone)]
pub struct ManualSubscriptionInfo {
    pub token: SubscriptionToken,
    pub paths: Vec<PathBuf>,
    pub config: StreamConfig,
    pub active: bool,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<(ManualSubscriptionInfo, BatchSink)>,
    fail_next: Option<SubscriptionError>,
}

/// Test double for the native facility
///
/// Clones share state, so a test can keep one handle after moving another into
/// an observer.
#[derive(Clone, Default)]
pub struct ManualEventSource {
    inner: Arc<Mutex<Inner>>,
}

/// Handle to a subscription created by [`ManualEventSource`]
#[derive(Debug)]
pub struct ManualSubscription {
    index: usize,
}

impl ManualEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `subscribe` call fail with `err`
    pub fn fail_next_subscribe(&self, err: SubscriptionError) {
        self.lock().fail_next = Some(err);
    }

    /// Every subscription ever created, oldest first
    pub fn subscriptions(&self) -> Vec<ManualSubscriptionInfo> {
        self.lock()
            .subscriptions
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// Number of subscriptions not yet released
    pub fn active_count(&self) -> usize {
        self.lock()
            .subscriptions
            .iter()
            .filter(|(info, _)| info.active)
            .count()
    }

    /// Deliver a batch to the newest active subscription
    ///
    /// Returns false when nothing is subscribed.
    pub fn emit(&self, batch: Vec<RawEvent>) -> bool {
        let sink = self
            .lock()
            .subscriptions
            .iter()
            .rev()
            .find(|(info, _)| info.active)
            .map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => deliver_on_thread(sink, batch),
            None => false,
        }
    }

    /// Deliver a batch through the sink of subscription `index`, released or not
    ///
    /// Simulates a facility that still has a batch in hand after unsubscribing.
    pub fn emit_to(&self, index: usize, batch: Vec<RawEvent>) -> bool {
        let sink = self
            .lock()
            .subscriptions
            .get(index)
            .map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => deliver_on_thread(sink, batch),
            None => false,
        }
    }
}

fn deliver_on_thread(sink: BatchSink, batch: Vec<RawEvent>) -> bool {
    let handle = std::thread::Builder::new()
        .name("manual-native-delivery".to_string())
        .spawn(move || sink.deliver(batch));
    match handle.map(|h| h.join()) {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            error!("Manual delivery thread panicked");
            false
        }
        Err(e) => {
            error!("Failed to spawn manual delivery thread: {e}");
            false
        }
    }
}

impl NativeEventSource for ManualEventSource {
    type Subscription = ManualSubscription;

    fn subscribe(
        &self,
        paths: &[PathBuf],
        config: &StreamConfig,
        sink: BatchSink,
    ) -> Result<Self::Subscription, SubscriptionError> {
        let mut inner = self.lock();
        if let Some(err) = inner.fail_next.take() {
            return Err(err);
        }
        if paths.is_empty() {
            return Err(SubscriptionError::EmptyPathList);
        }
        let info = ManualSubscriptionInfo {
            token: sink.token(),
            paths: paths.to_vec(),
            config: config.clone(),
            active: true,
        };
        inner.subscriptions.push((info, sink));
        Ok(ManualSubscription {
            index: inner.subscriptions.len() - 1,
        })
    }

    fn unsubscribe(&self, subscription: Self::Subscription) {
        if let Some((info, _)) = self.lock().subscriptions.get_mut(subscription.index) {
            info.active = false;
        }
    }
}
