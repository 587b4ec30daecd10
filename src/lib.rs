//! Message trigger listener with lease management
//!
//! This library connects a message-broker queue or topic subscription to a
//! function execution runtime. It receives messages, keeps their locks (or
//! their session's lock) alive while user logic runs, settles them according
//! to the outcome, and exposes queue metrics for scaling decisions.
//!
//! The broker is reached through the [`MessagingProvider`],
//! [`MessageReceiver`] and [`SessionClient`] traits; the runtime through
//! [`TriggerExecutor`]. An in-process [`MemoryBroker`] implements the broker
//! traits for tests and local runs.
//!

// Import all sub modules once...
mod batch;
mod broker;
mod client_cell;
mod domain;
mod listener;
mod listener_builder;
mod listener_state;
mod options;
mod processor;
mod pump;
mod renewer;
mod reporter;
mod retry;
mod scale;
mod trigger_input;

mod correlation;
mod error;
mod macros;

pub mod lease;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

use std::sync::{Mutex, MutexGuard};

// Re-export main types
pub use listener::Listener;
pub use listener_builder::ListenerBuilder;
pub use listener_state::{DispatchMode, ListenerState};

pub use options::{BatchOptions, ListenerOptions, MessageHandlerOptions, SessionHandlerOptions};
pub use retry::{Backoff, RetryConfig};

pub use correlation::CorrelationId;
pub use error::{BrokerError, BrokerErrorKind, BrokerResult, Result, TriggerError};

pub use processor::{Acknowledger, DefaultMessageProcessor, MessageProcessor, MessageProcessorPtr};
pub use reporter::{
    //
    reporter_fn,
    ErrorReporter,
    ErrorReporterPtr,
    ExceptionContext,
    LogErrorReporter,
    ReportAction,
};
pub use scale::{ScaleMonitor, ScaleMonitorDescriptor, TriggerMetrics};
pub use trigger_input::{TriggerData, TriggerInput, PARENT_ID_PROPERTY};

pub use broker::memory::{
    //
    create_memory_broker,
    CallLog,
    MemoryBroker,
    MemoryBrokerOptions,
    Operation,
    OutgoingMessage,
};

// --- public re-exports
pub use domain::{
    //
    executor_fn,
    ConnectionDescriptor,
    EntityIdentity,
    EntityProperties,
    EntityType,
    ExecutorPtr,
    FunctionResult,
    LockToken,
    MessageReceiver,
    MessagingProvider,
    MessagingProviderPtr,
    ReceiveMode,
    ReceivedMessage,
    ReceiverPtr,
    SessionClient,
    SessionClientPtr,
    SessionHandle,
    TriggerExecutor,
};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
