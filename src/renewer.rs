//! Background lock renewal.
//!
//! While user logic runs, a renewal task keeps the lock on its message (or
//! on its whole session) alive. The task stops on the first of:
//!
//! - the [`RenewalHandle`] being dropped (the invocation finished)
//! - the listener's shutdown token being cancelled
//! - `max_duration` elapsing since the task started
//! - a renewal failure that cannot be retried (lost lock, disposed client)
//!
//! ## Design notes
//!
//! The renewal cadence comes from [`lease::renew_after`](crate::lease::renew_after).
//! Cancellation never interrupts an in-flight renew call: the call is allowed
//! to finish and its outcome is discarded, so a renewal never races the
//! invocation's own complete/abandon with a spurious error report.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{
    // ---
    lease::renew_after_now,
    reporter::ReportHandle,
    Backoff,
    BrokerResult,
    ReceivedMessage,
    ReceiverPtr,
    ReportAction,
    RetryConfig,
    TriggerError,
};

/// What a renewal task keeps alive.
pub(crate) enum LeaseTarget {
    Message {
        receiver: ReceiverPtr,
        message: ReceivedMessage,
    },
    Session {
        receiver: ReceiverPtr,
    },
}

impl LeaseTarget {
    // ---
    fn locked_until(&self) -> DateTime<Utc> {
        match self {
            LeaseTarget::Message { message, .. } => message.locked_until,
            LeaseTarget::Session { receiver } => {
                receiver.session_locked_until().unwrap_or_else(Utc::now)
            }
        }
    }

    async fn renew(&self) -> BrokerResult<DateTime<Utc>> {
        match self {
            LeaseTarget::Message { receiver, message } => receiver.renew_message_lock(message).await,
            LeaseTarget::Session { receiver } => receiver.renew_session_lock().await,
        }
    }

    fn receiver(&self) -> &ReceiverPtr {
        match self {
            LeaseTarget::Message { receiver, .. } | LeaseTarget::Session { receiver } => receiver,
        }
    }

    #[cfg_attr(not(feature = "logging"), allow(dead_code))]
    fn describe(&self) -> String {
        match self {
            LeaseTarget::Message { message, .. } => format!("message {}", message.message_id),
            LeaseTarget::Session { receiver } => {
                format!("session {}", receiver.session_id().unwrap_or("<unknown>"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RenewalSettings {
    /// Total time after which renewal stops regardless of lease state.
    pub(crate) max_duration: Duration,
    /// Upper bound on how early before expiry a renewal is attempted.
    pub(crate) max_buffer: Duration,
    /// Delays between attempts after a retryable failure.
    pub(crate) retry: RetryConfig,
}

/// Stops its renewal task when dropped.
#[must_use = "dropping the handle stops the renewal"]
pub(crate) struct RenewalHandle {
    token: CancellationToken,
}

impl RenewalHandle {
    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Start renewing `target` on `tracker`.
pub(crate) fn spawn_renewal(
    target: LeaseTarget,
    settings: RenewalSettings,
    shutdown: &CancellationToken,
    reports: ReportHandle,
    tracker: &TaskTracker,
) -> RenewalHandle {
    // ---
    let token = shutdown.child_token();
    let own = token.clone();

    tracker.spawn(async move {
        // ---
        let cap = sleep(settings.max_duration);
        tokio::pin!(cap);

        let mut locked_until = target.locked_until();
        let mut backoff = Backoff::new(settings.retry.clone());
        let mut retry_pending = false;

        loop {
            let delay = if retry_pending {
                backoff.next_delay()
            } else {
                renew_after_now(locked_until, settings.max_buffer)
            };

            tokio::select! {
                biased;
                _ = own.cancelled() => break,
                _ = &mut cap => {
                    crate::log_debug!(
                        "lock renewal for {} stopped after {:?}",
                        target.describe(),
                        settings.max_duration
                    );
                    break;
                }
                _ = sleep(delay) => {}
            }

            let outcome = target.renew().await;
            if own.is_cancelled() {
                break;
            }

            match outcome {
                Ok(until) => {
                    locked_until = until;
                    retry_pending = false;
                    backoff.reset();
                }
                Err(err) if err.is_disposed() => break,
                Err(err) => {
                    let retry = err.should_retry();
                    let receiver = target.receiver();
                    reports.report(
                        &TriggerError::from(err),
                        ReportAction::RenewLock,
                        Some(receiver.client_id()),
                    );
                    if !retry {
                        break;
                    }
                    retry_pending = true;
                }
            }
        }
    });

    RenewalHandle { token }
}
