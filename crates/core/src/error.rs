use std::path::PathBuf;
use thiserror::Error;

/// Result type for fsobserver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fsobserver operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The native facility refused to create a subscription
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Creates a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Adds context to any error
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Returns the subscription failure, if this error is one
    pub fn as_subscription(&self) -> Option<&SubscriptionError> {
        match self {
            Self::Subscription(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure to create a subscription against the native change-notification facility.
///
/// Returned synchronously from `start`; the observer stays idle and nothing is retried.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// No paths were given
    #[error("no paths to watch")]
    EmptyPathList,

    /// A watched path does not exist
    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// A watched path cannot be read
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// The facility ran out of watch descriptors or similar resources
    #[error("native resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other facility failure
    #[error("native facility error: {0}")]
    Native(String),
}

impl SubscriptionError {
    /// Creates a native facility error
    pub fn native(msg: impl Into<String>) -> Self {
        Self::Native(msg.into())
    }
}

/// A consumer channel failed while an event was being dispatched
///
/// Contained at the dispatcher: logged and counted, never propagated into the
/// native delivery thread. Other channels still receive the event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFault {
    /// The registered callback panicked
    #[error("callback panicked: {0}")]
    CallbackPanicked(String),
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::with_context(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_error_converts() {
        let err: Error = SubscriptionError::PathNotFound(PathBuf::from("/missing")).into();
        assert!(matches!(
            err.as_subscription(),
            Some(SubscriptionError::PathNotFound(_))
        ));
        assert_eq!(
            err.to_string(),
            "Subscription error: path not found: /missing"
        );
    }

    #[test]
    fn test_context_wraps_source() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "boom",
        ));
        let err = res.context("reading config").unwrap_err();
        assert_eq!(err.to_string(), "reading config: boom");
        assert!(err.as_subscription().is_none());
    }
}
