//! Message processor hook and settlement policy.
//!
//! A [`MessageProcessor`] brackets every single-dispatch invocation:
//! `begin_processing` may veto a message before user logic runs, and
//! `complete_processing` settles it afterwards through an [`Acknowledger`].
//!
//! ## Settlement policy
//!
//! [`DefaultMessageProcessor`] applies the standard policy:
//!
//! - success with auto-complete enabled: complete the lock token
//! - failure not caused by a lost lock: abandon, so the broker redelivers
//!   without waiting for the lock to expire
//! - failure caused by a lost lock: nothing (the token is already void)
//!
//! Settlement is best effort. Errors from `complete`/`abandon` are handed to
//! the error reporter and never propagate. Once the listener is shutting
//! down, failures caused by the client already being closed are logged at
//! debug level instead of reported.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    reporter::ReportHandle,
    FunctionResult,
    LockToken,
    ReceivedMessage,
    ReceiverPtr,
    ReportAction,
    TriggerError,
};

/// Settles messages on the receiver they were received from.
pub struct Acknowledger {
    receiver: ReceiverPtr,
    reports: ReportHandle,
    shutdown: CancellationToken,
}

impl Acknowledger {
    // ---
    pub(crate) fn new(receiver: ReceiverPtr, reports: ReportHandle, shutdown: CancellationToken) -> Self {
        Self {
            receiver,
            reports,
            shutdown,
        }
    }

    pub fn receiver(&self) -> &ReceiverPtr {
        &self.receiver
    }

    /// Complete `lock_tokens` in one broker call. Returns whether the call
    /// succeeded; always true when the receive mode needs no settlement.
    pub async fn complete(&self, lock_tokens: &[LockToken]) -> bool {
        // ---
        if !self.receiver.receive_mode().requires_settlement() || lock_tokens.is_empty() {
            return true;
        }
        match self.receiver.complete(lock_tokens).await {
            Ok(()) => true,
            Err(err) => {
                self.report(err.into(), ReportAction::Complete);
                false
            }
        }
    }

    /// Abandon `lock_tokens` in one broker call. Same contract as
    /// [`complete`](Self::complete).
    pub async fn abandon(&self, lock_tokens: &[LockToken]) -> bool {
        // ---
        if !self.receiver.receive_mode().requires_settlement() || lock_tokens.is_empty() {
            return true;
        }
        match self.receiver.abandon(lock_tokens).await {
            Ok(()) => true,
            Err(err) => {
                self.report(err.into(), ReportAction::Abandon);
                false
            }
        }
    }

    fn report(&self, error: TriggerError, action: ReportAction) {
        // ---
        if error.is_disposed() && self.shutdown.is_cancelled() {
            crate::log_debug!(
                "{action:?} on '{}' skipped, receiver closed during shutdown",
                self.receiver.entity_path()
            );
            return;
        }
        self.reports
            .report(&error, action, Some(self.receiver.client_id()));
    }
}

/// Per-message processing hook for single dispatch.
///
/// Custom implementations may add bookkeeping but must preserve the
/// complete/abandon contract of [`DefaultMessageProcessor`].
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Called before user logic runs. Returning `false` skips the invocation
    /// and leaves the message unsettled.
    async fn begin_processing(&self, _message: &ReceivedMessage, _cancel: &CancellationToken) -> bool {
        true
    }

    /// Called with the invocation's outcome. Decides settlement.
    async fn complete_processing(
        &self,
        ack: &Acknowledger,
        message: &ReceivedMessage,
        result: &FunctionResult,
        cancel: &CancellationToken,
    );
}

pub type MessageProcessorPtr = Arc<dyn MessageProcessor>;

/// Standard settlement policy, see the module docs.
#[derive(Debug, Clone, Copy)]
pub struct DefaultMessageProcessor {
    auto_complete: bool,
}

impl DefaultMessageProcessor {
    pub fn new(auto_complete: bool) -> Self {
        Self { auto_complete }
    }

    pub fn auto_complete(&self) -> bool {
        self.auto_complete
    }
}

#[async_trait]
impl MessageProcessor for DefaultMessageProcessor {
    async fn complete_processing(
        &self,
        ack: &Acknowledger,
        message: &ReceivedMessage,
        result: &FunctionResult,
        _cancel: &CancellationToken,
    ) {
        // ---
        let tokens = std::slice::from_ref(&message.lock_token);
        if !result.succeeded {
            if !result.is_lock_lost() {
                ack.abandon(tokens).await;
            }
        } else if self.auto_complete {
            ack.complete(tokens).await;
        }
    }
}
