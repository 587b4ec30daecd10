// src/broker/memory/mod.rs

//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the broker client
//! traits (`MessagingProvider`, `MessageReceiver`, `SessionClient`). It is
//! intended primarily for testing, local execution, and as a reference for
//! broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for broker
//! clients. Adapters for real brokers are expected to approximate this
//! behavior as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! In particular, it establishes the following expectations:
//!
//! - Messages are handed out in send order (per session for session
//!   receivers) and each is locked for `lock_duration`.
//! - A message received for the n-th time reports `delivery_count == n`.
//!   Abandon and lock expiry count as a delivery; releasing a message by
//!   closing its session does not.
//! - Settling or renewing with an unknown or expired token fails with
//!   `LockLost`; any call on a closed client fails with `Disposed`.
//! - A session is locked by exactly one receiver at a time. Accepting when
//!   no session is free fails with `Timeout` once the wait elapses.
//!
//! ## Non-Goals
//!
//! Persistence, dead-lettering, scheduled messages, duplicate detection and
//! transactions are not modelled.

mod broker;

pub use broker::{
    //
    create_memory_broker,
    CallLog,
    MemoryBroker,
    MemoryBrokerOptions,
    Operation,
    OutgoingMessage,
};
