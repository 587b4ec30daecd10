//! Trigger input envelope.
//!
//! A [`TriggerInput`] is what the execution runtime receives: one message in
//! single dispatch, an ordered non-empty batch in batch dispatch. It keeps a
//! reference to the receiver the messages came from, because only that
//! receiver (or session) can settle them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::SecondsFormat;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    // ---
    CorrelationId,
    DispatchMode,
    LockToken,
    ReceivedMessage,
    ReceiverPtr,
    Result,
    TriggerError,
};

/// Application property naming the invocation that produced a message.
pub const PARENT_ID_PROPERTY: &str = "$TriggerParentId";

/// Correlation metadata describing an invocation's trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    pub parent_id: Option<Uuid>,
    pub details: BTreeMap<String, String>,
}

/// Value passed to the executor for one invocation.
///
/// The dispatch mode and the message count always agree: `Single` holds
/// exactly one message, `Batch` at least one.
#[derive(Clone)]
pub struct TriggerInput {
    dispatch: DispatchMode,
    messages: Arc<[ReceivedMessage]>,
    receiver: ReceiverPtr,
    invocation_id: CorrelationId,
}

impl TriggerInput {
    // ---
    pub fn single(message: ReceivedMessage, receiver: ReceiverPtr) -> Self {
        Self {
            dispatch: DispatchMode::Single,
            messages: Arc::from(vec![message]),
            receiver,
            invocation_id: CorrelationId::generate(),
        }
    }

    pub fn batch(messages: Vec<ReceivedMessage>, receiver: ReceiverPtr) -> Result<Self> {
        // ---
        if messages.is_empty() {
            return Err(TriggerError::EmptyBatch);
        }
        Ok(Self {
            dispatch: DispatchMode::Batch,
            messages: Arc::from(messages),
            receiver,
            invocation_id: CorrelationId::generate(),
        })
    }

    pub fn dispatch(&self) -> DispatchMode {
        self.dispatch
    }

    pub fn is_single(&self) -> bool {
        self.dispatch == DispatchMode::Single
    }

    /// Messages in receive order.
    pub fn messages(&self) -> &[ReceivedMessage] {
        &self.messages
    }

    /// The first (in single dispatch, the only) message.
    pub fn message(&self) -> &ReceivedMessage {
        &self.messages[0]
    }

    /// The receiver or session receiver that must settle these messages.
    pub fn receiver(&self) -> &ReceiverPtr {
        &self.receiver
    }

    pub fn invocation_id(&self) -> CorrelationId {
        self.invocation_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.receiver
            .session_id()
            .or_else(|| self.message().session_id.as_deref())
    }

    pub fn lock_tokens(&self) -> Vec<LockToken> {
        self.messages.iter().map(|m| m.lock_token.clone()).collect()
    }

    /// Correlation metadata for the execution runtime.
    ///
    /// Single dispatch reports `MessageId`, `DeliveryCount`,
    /// `EnqueuedTimeUtc` and `LockedUntilUtc`. Batch dispatch reports the
    /// same values comma-joined under `MessageIdArray`, `DeliveryCountArray`,
    /// `EnqueuedTimeUtcArray` and `LockedUntilArray`. Both add `SessionId`
    /// when the messages belong to a session.
    pub fn trigger_data(&self) -> TriggerData {
        // ---
        let mut details = BTreeMap::new();
        let timestamp = |t: &chrono::DateTime<chrono::Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);

        match self.dispatch {
            DispatchMode::Single => {
                let message = self.message();
                details.insert("MessageId".to_owned(), message.message_id.clone());
                details.insert("DeliveryCount".to_owned(), message.delivery_count.to_string());
                details.insert("EnqueuedTimeUtc".to_owned(), timestamp(&message.enqueued_time));
                details.insert("LockedUntilUtc".to_owned(), timestamp(&message.locked_until));
            }
            DispatchMode::Batch => {
                let join = |f: &dyn Fn(&ReceivedMessage) -> String| {
                    self.messages.iter().map(f).collect::<Vec<_>>().join(",")
                };
                details.insert("MessageIdArray".to_owned(), join(&|m| m.message_id.clone()));
                details.insert(
                    "DeliveryCountArray".to_owned(),
                    join(&|m| m.delivery_count.to_string()),
                );
                details.insert(
                    "EnqueuedTimeUtcArray".to_owned(),
                    join(&|m| timestamp(&m.enqueued_time)),
                );
                details.insert("LockedUntilArray".to_owned(), join(&|m| timestamp(&m.locked_until)));
            }
        }

        if let Some(session_id) = self.session_id() {
            details.insert("SessionId".to_owned(), session_id.to_owned());
        }

        let parent_id = self
            .message()
            .property(PARENT_ID_PROPERTY)
            .and_then(|value| Uuid::parse_str(value.trim()).ok());

        TriggerData { parent_id, details }
    }
}

impl fmt::Debug for TriggerInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerInput")
            .field("dispatch", &self.dispatch)
            .field("invocation_id", &self.invocation_id)
            .field("entity_path", &self.receiver.entity_path())
            .field("messages", &self.messages.len())
            .finish()
    }
}
