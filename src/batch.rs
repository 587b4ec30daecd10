//! Batch receive loop.
//!
//! Receives up to `maxMessageCount` messages at a time and hands them to one
//! invocation. With auto-complete enabled the batch is settled as a unit: one
//! `complete` call with every lock token on success, one `abandon` call on
//! failure. Partial outcomes are not supported.
//!
//! ## Sessions
//!
//! In session mode each loop holds at most one session. A session is closed
//! when a receive comes back empty (the session is drained), when a receive
//! or an invocation faults (so a fresh session can be accepted), and when the
//! loop exits. Up to `maxConcurrentSessions` loops run side by side; their
//! accept calls are serialized so only one is outstanding at a time.
//!
//! A faulted invocation in session mode does not abandon its messages:
//! closing the session releases their locks without counting a delivery.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    // ---
    pump::{close_session, execute, PumpContext},
    processor::Acknowledger,
    renewer::{spawn_renewal, LeaseTarget, RenewalHandle},
    Backoff,
    ReceivedMessage,
    ReceiverPtr,
    ReportAction,
    SessionClientPtr,
    SessionHandle,
    TriggerError,
    TriggerInput,
};

/// Where a batch loop gets its receiver from.
#[derive(Clone)]
pub(crate) enum BatchSource {
    Receiver(ReceiverPtr),
    Sessions {
        client: SessionClientPtr,
        accept_gate: Arc<Mutex<()>>,
    },
}

impl BatchSource {
    fn is_sessions(&self) -> bool {
        matches!(self, BatchSource::Sessions { .. })
    }
}

/// A session held by a batch loop, with its lock renewal.
struct HeldSession {
    handle: SessionHandle,
    _renewal: Option<RenewalHandle>,
}

impl HeldSession {
    fn is_usable(&self) -> bool {
        !self.handle.is_closed() && !self.handle.is_expired()
    }
}

enum Accept {
    Held(HeldSession),
    Retry,
    Cancelled,
}

/// Run one batch loop until receives are cancelled.
pub(crate) async fn run_batch_loop(ctx: Arc<PumpContext>, source: BatchSource) {
    // ---
    let options = &ctx.options.batch;
    let mut backoff = Backoff::new(ctx.options.receive_retry.clone());
    let mut held: Option<HeldSession> = None;

    crate::log_debug!("batch loop started for {}", ctx.entity);

    loop {
        if ctx.receive_token.is_cancelled() {
            break;
        }

        let receiver = match &source {
            BatchSource::Receiver(receiver) => receiver.clone(),
            BatchSource::Sessions {
                client,
                accept_gate,
            } => {
                if !held.as_ref().map(HeldSession::is_usable).unwrap_or(false) {
                    if let Some(stale) = held.take() {
                        close_session(&ctx, &stale.handle).await;
                    }
                    match accept(&ctx, client, accept_gate, &mut backoff).await {
                        Accept::Held(session) => held = Some(session),
                        Accept::Retry => continue,
                        Accept::Cancelled => break,
                    }
                }
                match &held {
                    Some(session) => session.handle.receiver().clone(),
                    None => continue,
                }
            }
        };

        let received = tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => break,
            received = receiver.receive(options.max_message_count, options.operation_timeout) => received,
        };

        let messages = match received {
            Ok(messages) => {
                backoff.reset();
                messages
            }
            Err(err) => {
                if ctx.is_shutdown_noise(&err) {
                    break;
                }
                ctx.reports.report(
                    &TriggerError::from(err),
                    ReportAction::Receive,
                    Some(receiver.client_id()),
                );
                if let Some(session) = held.take() {
                    close_session(&ctx, &session.handle).await;
                }
                if !ctx.pause(backoff.next_delay()).await {
                    break;
                }
                continue;
            }
        };

        if messages.is_empty() {
            if let Some(session) = held.take() {
                close_session(&ctx, &session.handle).await;
            }
            continue;
        }

        let faulted = !dispatch_batch(&ctx, &source, receiver, messages).await;
        if faulted {
            if let Some(session) = held.take() {
                close_session(&ctx, &session.handle).await;
            }
        }

        // A receiver that always has work never suspends on its own.
        tokio::task::yield_now().await;
    }

    if let Some(session) = held.take() {
        close_session(&ctx, &session.handle).await;
    }

    crate::log_debug!("batch loop stopped for {}", ctx.entity);
}

async fn accept(
    ctx: &PumpContext,
    client: &SessionClientPtr,
    accept_gate: &Mutex<()>,
    backoff: &mut Backoff,
) -> Accept {
    // ---
    let accepted = {
        let _gate = tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => return Accept::Cancelled,
            gate = accept_gate.lock() => gate,
        };
        tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => return Accept::Cancelled,
            accepted = client.accept_session(ctx.options.batch.operation_timeout) => accepted,
        }
    };

    match accepted {
        Ok(handle) => {
            backoff.reset();
            crate::log_debug!(
                "accepted session '{}' on {}",
                handle.session_id(),
                ctx.entity
            );
            ctx.sessions.insert(handle.clone());

            let receiver = handle.receiver().clone();
            let renewal = ctx
                .options
                .session_renewal()
                .filter(|_| receiver.receive_mode().requires_settlement())
                .map(|settings| {
                    spawn_renewal(
                        LeaseTarget::Session { receiver },
                        settings,
                        &ctx.shutdown,
                        ctx.reports.clone(),
                        &ctx.tracker,
                    )
                });
            Accept::Held(HeldSession {
                handle,
                _renewal: renewal,
            })
        }
        Err(err) if err.is_timeout() => Accept::Retry,
        Err(err) => {
            if ctx.is_shutdown_noise(&err) {
                return Accept::Cancelled;
            }
            ctx.reports.report(
                &TriggerError::from(err),
                ReportAction::AcceptMessageSession,
                Some(client.client_id()),
            );
            if ctx.pause(backoff.next_delay()).await {
                Accept::Retry
            } else {
                Accept::Cancelled
            }
        }
    }
}

/// Run one invocation for `messages` and settle them as a unit. Returns
/// false when the invocation faulted.
async fn dispatch_batch(
    ctx: &PumpContext,
    source: &BatchSource,
    receiver: ReceiverPtr,
    messages: Vec<ReceivedMessage>,
) -> bool {
    // ---
    let input = match TriggerInput::batch(messages, receiver.clone()) {
        Ok(input) => input,
        Err(err) => {
            ctx.reports
                .report(&err, ReportAction::UserCallback, Some(receiver.client_id()));
            return false;
        }
    };
    let tokens = input.lock_tokens();
    let auto_complete = ctx.options.batch.auto_complete;
    let ack = Acknowledger::new(receiver.clone(), ctx.reports.clone(), ctx.shutdown.clone());

    match execute(&ctx.executor, input, ctx.shutdown.child_token()).await {
        Ok(result) => {
            if auto_complete {
                if result.succeeded {
                    ack.complete(&tokens).await;
                } else if !result.is_lock_lost() {
                    ack.abandon(&tokens).await;
                }
            }
            true
        }
        Err(err) => {
            if !ctx.is_disposal_noise(&err) {
                ctx.reports
                    .report(&err, ReportAction::UserCallback, Some(receiver.client_id()));
            }
            if auto_complete && !source.is_sessions() && !err.is_lock_lost() {
                ack.abandon(&tokens).await;
            }
            false
        }
    }
}
