// src/pump/mod.rs

//! Single-dispatch receive pump.
//!
//! This module owns the state shared by every receive loop of a running
//! listener ([`PumpContext`]) and the per-message dispatch path used by both
//! single-dispatch pumps:
//!
//! - [`run_message_pump`]: plain entities, many messages in flight up to
//!   `maxConcurrentCalls`
//! - [`run_session_pump`]: session entities, one session at a time, its
//!   messages dispatched serially in order
//!
//! ## Dispatch path
//!
//! For each message: start lock renewal (peek-lock with auto-renew enabled),
//! ask the [`MessageProcessor`](crate::MessageProcessor) whether to proceed,
//! run the executor, stop renewal, then settle through the processor. A fault
//! raised by the executor (an `Err` or a panic) is reported and the message
//! abandoned unless its lock is already lost.
//!
//! Every exit path releases the concurrency permit and the renewal task,
//! because both are owned by the dispatch future and dropped with it.

mod message_pump;
mod session_pump;

pub(crate) use message_pump::run_message_pump;
pub(crate) use session_pump::run_session_pump;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{
    // ---
    lock_ignore_poison,
    processor::{Acknowledger, MessageProcessorPtr},
    renewer::{spawn_renewal, LeaseTarget, RenewalSettings},
    reporter::ReportHandle,
    EntityIdentity,
    ExecutorPtr,
    FunctionResult,
    ListenerOptions,
    ReceivedMessage,
    ReceiverPtr,
    ReportAction,
    Result,
    SessionHandle,
    TriggerError,
    TriggerInput,
};

/// State shared by the receive loops of one listener run.
pub(crate) struct PumpContext {
    pub(crate) entity: Arc<EntityIdentity>,
    pub(crate) options: Arc<ListenerOptions>,
    pub(crate) executor: ExecutorPtr,
    pub(crate) processor: MessageProcessorPtr,
    pub(crate) reports: ReportHandle,

    /// Cancelled on drain and on shutdown. Stops new receives only.
    pub(crate) receive_token: CancellationToken,

    /// Cancelled on stop, cancel and dispose. Handed (as a child) to every
    /// invocation and renewal.
    pub(crate) shutdown: CancellationToken,

    pub(crate) tracker: TaskTracker,

    /// Bounds in-flight single-dispatch invocations.
    pub(crate) concurrency: Arc<Semaphore>,

    pub(crate) sessions: ActiveSessions,
}

impl PumpContext {
    // ---
    /// Sleep for `delay` unless receives are cancelled first. Returns false
    /// when cancelled.
    pub(crate) async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.receive_token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Receive-side failures are expected once the listener is shutting down
    /// and the client has been disposed underneath a pending call.
    pub(crate) fn is_shutdown_noise(&self, error: &crate::BrokerError) -> bool {
        error.is_disposed() && self.receive_token.is_cancelled()
    }

    /// Invocation failures caused by a client closed during shutdown.
    pub(crate) fn is_disposal_noise(&self, error: &TriggerError) -> bool {
        error.is_disposed() && self.shutdown.is_cancelled()
    }
}

/// Sessions currently held by the listener.
#[derive(Default)]
pub(crate) struct ActiveSessions {
    held: Mutex<Vec<SessionHandle>>,
}

impl ActiveSessions {
    // ---
    pub(crate) fn insert(&self, session: SessionHandle) {
        lock_ignore_poison(&self.held).push(session);
    }

    pub(crate) fn remove(&self, session_id: &str) {
        lock_ignore_poison(&self.held).retain(|s| s.session_id() != session_id);
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        lock_ignore_poison(&self.held)
            .iter()
            .map(|s| s.session_id().to_owned())
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<SessionHandle> {
        std::mem::take(&mut *lock_ignore_poison(&self.held))
    }
}

/// Run the executor, turning a panic into an execution fault.
pub(crate) async fn execute(
    executor: &ExecutorPtr,
    input: TriggerInput,
    cancel: CancellationToken,
) -> Result<FunctionResult> {
    // ---
    AssertUnwindSafe(executor.try_execute(input, cancel))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(TriggerError::Execution(panic_message(panic))))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    // ---
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("executor panicked: {text}")
    } else {
        "executor panicked".to_owned()
    }
}

/// Dispatch one message to one invocation and settle it.
///
/// `renewal` is `None` when message locks are not renewed (auto-renew
/// disabled, or the session's lock is renewed instead).
pub(crate) async fn dispatch_message(
    ctx: &PumpContext,
    receiver: ReceiverPtr,
    message: ReceivedMessage,
    renewal: Option<RenewalSettings>,
) {
    // ---
    let renewal = renewal
        .filter(|_| receiver.receive_mode().requires_settlement())
        .map(|settings| {
            spawn_renewal(
                LeaseTarget::Message {
                    receiver: receiver.clone(),
                    message: message.clone(),
                },
                settings,
                &ctx.shutdown,
                ctx.reports.clone(),
                &ctx.tracker,
            )
        });

    let cancel = ctx.shutdown.child_token();
    if !ctx.processor.begin_processing(&message, &cancel).await {
        crate::log_debug!(
            "message {} on '{}' skipped by processor",
            message.message_id,
            receiver.entity_path()
        );
        return;
    }

    let input = TriggerInput::single(message.clone(), receiver.clone());
    let outcome = execute(&ctx.executor, input, cancel.clone()).await;
    drop(renewal);

    let ack = Acknowledger::new(receiver.clone(), ctx.reports.clone(), ctx.shutdown.clone());
    match outcome {
        Ok(result) => {
            ctx.processor
                .complete_processing(&ack, &message, &result, &cancel)
                .await;
        }
        Err(err) => {
            if !ctx.is_disposal_noise(&err) {
                ctx.reports
                    .report(&err, ReportAction::UserCallback, Some(receiver.client_id()));
            }
            if !err.is_lock_lost() {
                ack.abandon(std::slice::from_ref(&message.lock_token)).await;
            }
        }
    }
}

/// Close a session, releasing its lock. Failures are reported unless they
/// only say the session is already gone.
pub(crate) async fn close_session(ctx: &PumpContext, session: &SessionHandle) {
    // ---
    ctx.sessions.remove(session.session_id());
    let receiver = session.receiver();
    if receiver.is_closed() {
        return;
    }

    match receiver.close().await {
        Ok(()) => {
            crate::log_debug!(
                "closed session '{}' on '{}'",
                session.session_id(),
                receiver.entity_path()
            );
        }
        Err(err) if err.is_disposed() || err.is_lock_lost() => {}
        Err(err) => {
            ctx.reports.report(
                &TriggerError::from(err),
                ReportAction::CloseMessageSession,
                Some(receiver.client_id()),
            );
        }
    }
}
