// src/pump/session_pump.rs

use std::sync::Arc;

use crate::{
    // ---
    renewer::{spawn_renewal, LeaseTarget},
    Backoff,
    SessionClientPtr,
    SessionHandle,
    ReportAction,
    TriggerError,
};

use super::{close_session, dispatch_message, PumpContext};

/// Accept sessions one at a time and drain each in order.
///
/// An accept timeout only means no session is waiting; the pump simply
/// tries again.
pub(crate) async fn run_session_pump(ctx: Arc<PumpContext>, client: SessionClientPtr) {
    // ---
    let wait = ctx.options.session_handler.message_wait_timeout;
    let mut backoff = Backoff::new(ctx.options.receive_retry.clone());

    crate::log_debug!("session pump started for {}", ctx.entity);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => break,
            accepted = client.accept_session(wait) => accepted,
        };

        let session = match accepted {
            Ok(session) => {
                backoff.reset();
                session
            }
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                if ctx.is_shutdown_noise(&err) {
                    break;
                }
                ctx.reports.report(
                    &TriggerError::from(err),
                    ReportAction::AcceptMessageSession,
                    Some(client.client_id()),
                );
                if !ctx.pause(backoff.next_delay()).await {
                    break;
                }
                continue;
            }
        };

        crate::log_debug!(
            "accepted session '{}' on {}",
            session.session_id(),
            ctx.entity
        );
        drain_session(&ctx, session).await;
    }

    crate::log_debug!("session pump stopped for {}", ctx.entity);
}

/// Dispatch the session's messages one by one until it runs dry, its lock
/// is lost, or receives are cancelled; then close it.
async fn drain_session(ctx: &PumpContext, session: SessionHandle) {
    // ---
    let receiver = session.receiver().clone();
    let wait = ctx.options.session_handler.message_wait_timeout;
    ctx.sessions.insert(session.clone());

    let renewal = ctx
        .options
        .session_renewal()
        .filter(|_| receiver.receive_mode().requires_settlement())
        .map(|settings| {
            spawn_renewal(
                LeaseTarget::Session {
                    receiver: receiver.clone(),
                },
                settings,
                &ctx.shutdown,
                ctx.reports.clone(),
                &ctx.tracker,
            )
        });

    loop {
        if session.is_closed() || session.is_expired() {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => break,
            received = receiver.receive(1, wait) => received,
        };

        match received {
            Ok(messages) if messages.is_empty() => break,
            Ok(messages) => {
                for message in messages {
                    let Ok(_permit) = ctx.concurrency.acquire().await else {
                        break;
                    };
                    dispatch_message(ctx, receiver.clone(), message, None).await;
                }
            }
            Err(err) => {
                if !ctx.is_shutdown_noise(&err) {
                    ctx.reports.report(
                        &TriggerError::from(err),
                        ReportAction::Receive,
                        Some(receiver.client_id()),
                    );
                }
                break;
            }
        }
    }

    drop(renewal);
    close_session(ctx, &session).await;
}
