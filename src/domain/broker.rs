// src/domain/broker.rs

//! Broker client abstractions.
//!
//! This module defines the interface the listener needs from a message broker
//! client. It intentionally avoids any reference to concrete protocols or
//! client libraries: connection management, the wire protocol and
//! authentication all live behind these traits.
//!
//! Failures are returned as [`BrokerError`] values whose
//! [`kind`](BrokerError::kind) was decided by the client. The listener only
//! inspects that classification.
//!
//! The in-memory broker under `src/broker/memory/` provides the reference
//! semantics for every trait here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{
    // ---
    BrokerError,
    BrokerResult,
    EntityIdentity,
};

/// Opaque token proving ownership of a message lock.
///
/// Becomes invalid once the message is completed, abandoned or its lock
/// expires.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Arc<str>);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for LockToken
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        LockToken(value.into())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the broker treats a message handed to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReceiveMode {
    // ---
    /// The message is locked and must be completed or abandoned explicitly.
    #[default]
    PeekLock,

    /// The message is removed on receipt. Nothing to settle or renew.
    ReceiveAndDelete,
}

impl ReceiveMode {
    /// Whether received messages must be completed or abandoned.
    pub fn requires_settlement(self) -> bool {
        self == ReceiveMode::PeekLock
    }
}

/// Runtime counters of an entity, as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityProperties {
    /// Messages waiting to be received or currently locked.
    pub active_message_count: i64,
    pub partition_count: i32,
}

/// One message handed out by the broker.
///
/// `locked_until` is the lock expiry at the time of receipt. Renewals return
/// the new expiry rather than mutating the message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub enqueued_time: DateTime<Utc>,
    pub locked_until: DateTime<Utc>,
    pub lock_token: LockToken,
    pub session_id: Option<Arc<str>>,
    pub content_type: Option<String>,
    pub properties: HashMap<String, String>,
    pub body: Bytes,
}

impl ReceivedMessage {
    /// Parse the body as JSON.
    pub fn deserialize_body<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Receives and settles messages from one entity (or one session of it).
///
/// # Contract
///
/// - `receive` waits up to `max_wait` for at least one message and returns
///   at most `max_messages`. An empty vector means nothing arrived in time.
/// - `complete`, `abandon` and `renew_message_lock` fail with
///   [`LockLost`](crate::BrokerErrorKind::LockLost) when a token is unknown
///   or its lock has expired.
/// - Every call on a closed receiver fails with
///   [`Disposed`](crate::BrokerErrorKind::Disposed).
///
/// Session receivers additionally expose their session id and session lock.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    // ---
    /// Path of the entity this receiver reads from.
    fn entity_path(&self) -> &str;

    /// Identifier of this client instance, used in diagnostics.
    fn client_id(&self) -> &str;

    fn receive_mode(&self) -> ReceiveMode;

    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<ReceivedMessage>>;

    async fn complete(&self, lock_tokens: &[LockToken]) -> BrokerResult<()>;

    async fn abandon(&self, lock_tokens: &[LockToken]) -> BrokerResult<()>;

    /// Extend the lock on `message`, returning the new expiry.
    async fn renew_message_lock(&self, message: &ReceivedMessage) -> BrokerResult<DateTime<Utc>>;

    /// Look at the next available message without locking it.
    async fn peek(&self) -> BrokerResult<Option<ReceivedMessage>>;

    async fn entity_properties(&self) -> BrokerResult<EntityProperties>;

    /// Close the receiver. For a session receiver this releases the session
    /// lock, and with it the locks of any unsettled messages.
    async fn close(&self) -> BrokerResult<()>;

    fn is_closed(&self) -> bool;

    fn session_id(&self) -> Option<&str> {
        None
    }

    fn session_locked_until(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Extend the session lock, returning the new expiry.
    async fn renew_session_lock(&self) -> BrokerResult<DateTime<Utc>> {
        Err(BrokerError::fatal(format!(
            "receiver for '{}' is not bound to a session",
            self.entity_path()
        )))
    }
}

pub type ReceiverPtr = Arc<dyn MessageReceiver>;

/// An accepted, exclusively locked session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Arc<str>,
    receiver: ReceiverPtr,
}

impl SessionHandle {
    // ---
    pub fn new(session_id: impl Into<Arc<str>>, receiver: ReceiverPtr) -> Self {
        Self {
            session_id: session_id.into(),
            receiver,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn receiver(&self) -> &ReceiverPtr {
        &self.receiver
    }

    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.receiver.session_locked_until()
    }

    /// True once the session lock is past its expiry.
    pub fn is_expired(&self) -> bool {
        self.locked_until()
            .map(|until| until <= Utc::now())
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("entity_path", &self.receiver.entity_path())
            .field("locked_until", &self.locked_until())
            .finish()
    }
}

/// Accepts sessions of a session-enabled entity.
#[async_trait]
pub trait SessionClient: Send + Sync {
    // ---
    fn entity_path(&self) -> &str;

    fn client_id(&self) -> &str;

    /// Lock the next available session. Fails with
    /// [`Timeout`](crate::BrokerErrorKind::Timeout) when none becomes free
    /// within `max_wait`.
    async fn accept_session(&self, max_wait: Duration) -> BrokerResult<SessionHandle>;

    async fn close(&self) -> BrokerResult<()>;
}

pub type SessionClientPtr = Arc<dyn SessionClient>;

/// Factory for broker clients.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    // ---
    async fn create_receiver(
        &self,
        entity: &EntityIdentity,
        prefetch_count: u32,
    ) -> BrokerResult<ReceiverPtr>;

    async fn create_session_client(
        &self,
        entity: &EntityIdentity,
        prefetch_count: u32,
    ) -> BrokerResult<SessionClientPtr>;
}

pub type MessagingProviderPtr = Arc<dyn MessagingProvider>;
