//! Domain layer public interface.
//!
//! This module defines the abstractions the listener is written against:
//! entity identity, the broker client traits and the execution runtime
//! boundary. None of them reference a concrete broker or runtime.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod entity;
mod executor;

// --- Entity domain re-exports ---

pub use entity::{
    //
    ConnectionDescriptor,
    EntityIdentity,
    EntityType,
};

// --- Broker domain re-exports ---

pub use broker::{
    //
    EntityProperties,
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
};

// --- Executor domain re-exports ---

pub use executor::{
    //
    executor_fn,
    ExecutorPtr,
    FunctionResult,
    TriggerExecutor,
};
