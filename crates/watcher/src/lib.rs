#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Filesystem change observer
//!
//! This crate bridges a native change-notification facility to application code:
//! - Decodes raw, flag-encoded native batches into [`EventRecord`]s
//! - Owns the native subscription through a start/stop lifecycle
//! - Fans every event out to a callback, broadcast subscribers and a pull sequence
//!
//! # Example
//!
//! ```no_run
//! use fsobserver_core::ObserverConfig;
//! use fsobserver_watcher::Observer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let observer = Observer::new(ObserverConfig::default())?;
//! observer.set_callback(|event| println!("changed: {event}"));
//! let mut events = observer.event_sequence().expect("first claim");
//!
//! observer.start(["/path/to/project"])?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?} {:?}", event.path(), event.flags().decode());
//! }
//! # Ok(())
//! # }
//! ```

// Private implementation modules
mod bridge;
mod broadcast;
mod dispatcher;
mod events;
mod notify_source;
mod observer;
mod sequence;
mod source;

pub mod testing;

// Public exports - minimal API surface
pub use broadcast::EventStream;
pub use dispatcher::{Callback, ObserverStats};
pub use events::{EventRecord, RawEvent};
pub use notify_source::{NotifyEventSource, NotifySubscription};
pub use observer::{Observer, ObserverState};
pub use sequence::EventSequence;
pub use source::{BatchSink, NativeEventSource, SubscriptionToken};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::events::EventRecord;
    pub use crate::observer::{Observer, ObserverState};
    pub use fsobserver_core::{FlagSet, ObserverConfig, StreamConfig};
}
