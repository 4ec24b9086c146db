#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Core types for the fsobserver filesystem change observer
//!
//! This crate provides the foundational pieces shared by the observer:
//!
//! - **Flags**: the [`FlagSet`] bitmask decoding native event-flag words
//! - **Configuration**: subscription and observer settings
//! - **Error handling**: unified error types
//!

pub mod config;
pub mod error;
pub mod flags;

// Re-export main types for convenience
pub use config::{ObserverConfig, ResumePoint, StreamConfig};
pub use error::{DeliveryFault, Error, Result, ResultExt, SubscriptionError};
pub use flags::FlagSet;

/// Version of the core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ObserverConfig, StreamConfig};
    pub use crate::error::{Result, ResultExt};
    pub use crate::flags::FlagSet;
}
