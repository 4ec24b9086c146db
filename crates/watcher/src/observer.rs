//! Observer lifecycle
//!
//! An [`Observer`] owns at most one native subscription. `start` moves it to
//! running (tearing down any existing subscription first), `stop` moves it back
//! to idle, and dropping the observer always stops it.

use crate::bridge::{self, Bridge};
use crate::broadcast::EventStream;
use crate::dispatcher::{Callback, Dispatcher, ObserverStats};
use crate::events::EventRecord;
use crate::notify_source::NotifyEventSource;
use crate::sequence::EventSequence;
use crate::source::{BatchSink, NativeEventSource, SubscriptionToken};
use fsobserver_core::error::Result;
use fsobserver_core::{Error, ObserverConfig, StreamConfig, SubscriptionError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use tracing::{debug, error, info, warn};

/// Lifecycle state of an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Idle,
    Running,
}

struct ActiveSubscription<T> {
    bridge: Arc<Bridge>,
    native: T,
}

type LifecycleGuard<'a, T> = MutexGuard<'a, Option<ActiveSubscription<T>>>;

/// Filesystem change observer
pub struct Observer<S: NativeEventSource = NotifyEventSource> {
    source: Arc<S>,
    config: ObserverConfig,
    dispatcher: Arc<Dispatcher>,
    /// Serializes start/stop
    active: Mutex<Option<ActiveSubscription<S::Subscription>>>,
    /// Readable without the lifecycle lock, so callbacks can query state
    running: AtomicBool,
    /// Token of the running subscription, 0 when idle
    current: AtomicU64,
    watched_paths: RwLock<Vec<PathBuf>>,
}

impl Observer<NotifyEventSource> {
    /// Create an observer backed by the platform's notify backend
    pub fn new(config: ObserverConfig) -> Result<Self> {
        Self::with_source(NotifyEventSource::new(), config)
    }
}

impl<S: NativeEventSource> Observer<S> {
    /// Create an observer on top of any native source
    pub fn with_source(source: S, config: ObserverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source: Arc::new(source),
            dispatcher: Arc::new(Dispatcher::new(config.sequence_high_water_mark)),
            config,
            active: Mutex::new(None),
            running: AtomicBool::new(false),
            current: AtomicU64::new(0),
            watched_paths: RwLock::new(Vec::new()),
        })
    }

    /// Start observing `paths` with the configured stream settings
    pub fn start<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let stream = self.config.stream.clone();
        self.start_with(paths, stream)
    }

    /// Start observing `paths` with explicit stream settings
    ///
    /// A running observer is fully stopped first, so two native subscriptions
    /// never coexist. If the facility refuses the subscription the observer is
    /// left idle and the error is returned.
    pub fn start_with<I, P>(&self, paths: I, stream: StreamConfig) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let Some(mut active) = self.lock_lifecycle() else {
            warn!("Start requested from a callback while another thread is stopping");
            return Err(Error::invalid_input(
                "observer is being stopped by another thread",
            ));
        };

        if let Some(previous) = active.take() {
            info!(
                subscription = %previous.bridge.token(),
                "Observer already running; restarting"
            );
            self.teardown(previous);
        }

        if paths.is_empty() {
            return Err(SubscriptionError::EmptyPathList.into());
        }

        let token = SubscriptionToken::next();
        let bridge = Arc::new(Bridge::new(token, Arc::clone(&self.dispatcher)));
        bridge::register(Arc::clone(&bridge));
        self.current.store(token.as_u64(), Ordering::Release);

        match self.source.subscribe(&paths, &stream, BatchSink::new(token)) {
            Ok(native) => {
                info!(subscription = %token, paths = ?paths, "Observer started");
                *self
                    .watched_paths
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = paths;
                *active = Some(ActiveSubscription { bridge, native });
                self.running.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                bridge.close();
                self.current.store(0, Ordering::Release);
                bridge::unregister(token);
                warn!(subscription = %token, "Failed to create native subscription: {e}");
                Err(e.into())
            }
        }
    }

    /// Stop observing
    ///
    /// Idempotent. When it returns, no further events reach any channel and the
    /// pull sequence has ended. Called from a callback, the current event reaches
    /// no further channel, the rest of its batch is dropped and the native handle
    /// is released on a helper thread. If another thread is already stopping, a
    /// callback's `stop` only closes delivery and leaves the teardown to it.
    pub fn stop(&self) {
        let Some(mut active) = self.lock_lifecycle() else {
            debug!("Stop requested from a callback during a concurrent stop");
            bridge::close_from_delivery(self.current_token());
            return;
        };
        match active.take() {
            Some(subscription) => self.teardown(subscription),
            None => debug!("Observer already idle"),
        }
    }

    /// Take the lifecycle lock
    ///
    /// On the running subscription's own delivery thread the lock is only tried:
    /// whoever holds it may be waiting for this very delivery to finish. `None`
    /// means it is held elsewhere.
    fn lock_lifecycle(&self) -> Option<LifecycleGuard<'_, S::Subscription>> {
        if !bridge::is_delivering(self.current_token()) {
            return Some(self.active.lock().unwrap_or_else(PoisonError::into_inner));
        }
        match self.active.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn current_token(&self) -> SubscriptionToken {
        SubscriptionToken::from_u64(self.current.load(Ordering::Acquire))
    }

    fn teardown(&self, subscription: ActiveSubscription<S::Subscription>) {
        let ActiveSubscription { bridge, native } = subscription;
        let token = bridge.token();

        self.running.store(false, Ordering::Release);
        bridge.close();
        self.current.store(0, Ordering::Release);
        bridge::unregister(token);

        if bridge::is_delivering(token) {
            self.release_detached(token, native);
        } else {
            self.source.unsubscribe(native);
        }

        self.watched_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dispatcher.close_sequence();
        info!(subscription = %token, "Observer stopped");
    }

    /// Release a native handle without blocking the delivery thread it owns
    fn release_detached(&self, token: SubscriptionToken, native: S::Subscription) {
        let source = Arc::clone(&self.source);
        let native = Arc::new(Mutex::new(Some(native)));
        let for_thread = Arc::clone(&native);
        let spawned = std::thread::Builder::new()
            .name(format!("fsobserver-release-{}", token.as_u64()))
            .spawn(move || {
                let taken = for_thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(native) = taken {
                    source.unsubscribe(native);
                }
            });
        if let Err(e) = spawned {
            error!(subscription = %token, "Failed to spawn release thread: {e}; releasing inline");
            let taken = native.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(native) = taken {
                self.source.unsubscribe(native);
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ObserverState {
        if self.is_running() {
            ObserverState::Running
        } else {
            ObserverState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Paths of the current subscription; empty when idle
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check if a path is covered by the current subscription
    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| path.starts_with(p))
    }

    /// Install the synchronous callback, replacing any previous one
    ///
    /// Runs on the native delivery thread; keep it short. A panic is logged and
    /// counted and does not affect the other channels.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.dispatcher.set_callback(callback);
    }

    pub fn clear_callback(&self) {
        self.dispatcher.clear_callback();
    }

    pub fn has_callback(&self) -> bool {
        self.dispatcher.has_callback()
    }

    /// New broadcast subscriber receiving every event from now on
    pub fn subscribe(&self) -> EventStream {
        self.dispatcher.subscribe()
    }

    /// The observer's pull sequence
    ///
    /// Only the first call returns it. It ends at the next `stop`.
    pub fn event_sequence(&self) -> Option<EventSequence> {
        self.dispatcher.claim_sequence()
    }

    /// Id of the most recently dispatched event, usable as a resume point
    pub fn last_event_id(&self) -> Option<u64> {
        self.dispatcher.stats().last_event_id()
    }

    pub fn stats(&self) -> ObserverStats {
        self.dispatcher.stats().snapshot()
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }
}

impl<S: NativeEventSource> Drop for Observer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
