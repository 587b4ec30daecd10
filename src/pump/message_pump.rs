// src/pump/message_pump.rs

use std::sync::Arc;

use crate::{
    // ---
    Backoff,
    ReceiverPtr,
    ReportAction,
    TriggerError,
};

use super::{dispatch_message, PumpContext};

/// Receive plain messages until receives are cancelled.
///
/// Concurrency permits are taken before receiving: the pump waits for one
/// free slot, grabs any others that are free, and asks the broker for that
/// many messages. Each message is dispatched on its own task, which holds
/// its permit until settlement is done.
pub(crate) async fn run_message_pump(ctx: Arc<PumpContext>, receiver: ReceiverPtr) {
    // ---
    let max_wait = ctx.options.message_handler.max_wait_time;
    let renewal = ctx.options.message_renewal();
    let mut backoff = Backoff::new(ctx.options.receive_retry.clone());

    crate::log_debug!("message pump started for {}", ctx.entity);

    loop {
        let first = tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => break,
            permit = ctx.concurrency.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let mut permits = vec![first];
        while let Ok(permit) = ctx.concurrency.clone().try_acquire_owned() {
            permits.push(permit);
        }

        let received = tokio::select! {
            biased;
            _ = ctx.receive_token.cancelled() => break,
            received = receiver.receive(permits.len(), max_wait) => received,
        };

        let messages = match received {
            Ok(messages) => {
                backoff.reset();
                messages
            }
            Err(err) => {
                drop(permits);
                if ctx.is_shutdown_noise(&err) {
                    break;
                }
                ctx.reports.report(
                    &TriggerError::from(err),
                    ReportAction::Receive,
                    Some(receiver.client_id()),
                );
                if !ctx.pause(backoff.next_delay()).await {
                    break;
                }
                continue;
            }
        };

        for message in messages {
            let permit = match permits.pop() {
                Some(permit) => permit,
                None => match ctx.concurrency.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task_ctx = ctx.clone();
            let receiver = receiver.clone();
            let renewal = renewal.clone();
            ctx.tracker.spawn(async move {
                let _permit = permit;
                dispatch_message(&task_ctx, receiver, message, renewal).await;
            });
        }
    }

    crate::log_debug!("message pump stopped for {}", ctx.entity);
}
