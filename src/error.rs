//! Error types.
//!
//! Broker failures are carried as a [`BrokerError`] tagged with a
//! [`BrokerErrorKind`]. The pump, batch loop and lock renewer branch on that
//! classification with ordinary conditionals; nothing downcasts.

use std::fmt;

use thiserror::Error;

/// Classification of a broker failure, as decided by the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerErrorKind {
    // ---
    /// Temporary failure (throttling, connection blip). Safe to try again.
    Transient,

    /// The operation did not complete in the requested time. Expected when an
    /// entity is idle, e.g. no session is available to accept.
    Timeout,

    /// The lock on a message is gone; its token can no longer be settled.
    LockLost,

    /// The lock on a session is gone; none of its messages can be settled.
    SessionLockLost,

    /// The client (or the object behind it) has been closed.
    Disposed,

    /// Anything else. Not worth retrying.
    Fatal,
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerErrorKind::Transient => "transient",
            BrokerErrorKind::Timeout => "timeout",
            BrokerErrorKind::LockLost => "lock lost",
            BrokerErrorKind::SessionLockLost => "session lock lost",
            BrokerErrorKind::Disposed => "disposed",
            BrokerErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// A failed broker call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BrokerError {
    kind: BrokerErrorKind,
    message: String,
}

impl BrokerError {
    // ---
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Timeout, message)
    }

    pub fn lock_lost(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::LockLost, message)
    }

    pub fn session_lock_lost(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::SessionLockLost, message)
    }

    pub fn disposed(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Disposed, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Fatal, message)
    }

    pub fn kind(&self) -> BrokerErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for message and session lock loss.
    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::LockLost | BrokerErrorKind::SessionLockLost
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == BrokerErrorKind::Timeout
    }

    pub fn is_disposed(&self) -> bool {
        self.kind == BrokerErrorKind::Disposed
    }

    /// Whether repeating the same call may succeed.
    pub fn should_retry(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::Transient | BrokerErrorKind::Timeout
        )
    }
}

/// Errors surfaced by the listener and its collaborators.
#[derive(Error, Debug)]
pub enum TriggerError {
    /// `start()` was called on a listener that is already running.
    #[error("the listener has already been started")]
    AlreadyStarted,

    /// `stop()`, `drain()` or `cancel()` was called on a listener that is not running.
    #[error("the listener has not yet been started or has already been stopped")]
    NotStarted,

    /// The listener was disposed; it cannot be used again.
    #[error("the listener has been disposed")]
    Disposed,

    /// A broker call failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The execution runtime faulted while running user logic.
    #[error("function execution failed: {0}")]
    Execution(String),

    /// A batch trigger input was built from zero messages.
    #[error("a batch trigger input requires at least one message")]
    EmptyBatch,

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required builder field or connection setting was not provided.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TriggerError {
    // ---
    /// True when the error wraps a lost message or session lock.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, TriggerError::Broker(err) if err.is_lock_lost())
    }

    /// True when the error wraps a disposed broker client.
    pub fn is_disposed(&self) -> bool {
        matches!(self, TriggerError::Broker(err) if err.is_disposed())
    }
}

/// Result type alias for listener operations
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Result type alias for broker client calls
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
