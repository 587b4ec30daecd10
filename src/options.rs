//! Listener configuration.
//!
//! This type intentionally contains no broker connection details. Those live
//! in the [`ConnectionDescriptor`](crate::ConnectionDescriptor) of the
//! entity, so the options can be logged verbatim when a listener starts.
//!
//! Options serialize to camelCase JSON with durations written as
//! `hh:mm:ss[.fffffff]` (an optional `d.` day prefix is accepted):
//!
//! ```json
//! {
//!   "prefetchCount": 0,
//!   "maxRenewBuffer": "00:00:10",
//!   "messageHandler": {
//!     "maxConcurrentCalls": 16,
//!     "autoComplete": true,
//!     "maxAutoRenewDuration": "00:05:00",
//!     "maxWaitTime": "00:01:00"
//!   }
//! }
//! ```
//!
//! Every field has a default, so a document only needs to name what it
//! changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    // ---
    lease::DEFAULT_MAX_RENEW_BUFFER,
    renewer::RenewalSettings,
    Result,
    RetryConfig,
    TriggerError,
};

/// Settings for single dispatch without sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageHandlerOptions {
    /// Upper bound on concurrently running invocations.
    pub max_concurrent_calls: usize,

    /// Complete a message when its invocation succeeds.
    pub auto_complete: bool,

    /// How long a message lock is renewed at most. Zero disables renewal.
    #[serde(with = "timespan")]
    pub max_auto_renew_duration: Duration,

    /// How long one receive call waits for a message.
    #[serde(with = "timespan")]
    pub max_wait_time: Duration,
}

impl Default for MessageHandlerOptions {
    fn default() -> Self {
        // ---
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_concurrent_calls: parallelism * 16,
            auto_complete: true,
            max_auto_renew_duration: Duration::from_secs(5 * 60),
            max_wait_time: Duration::from_secs(60),
        }
    }
}

/// Settings for session-enabled entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionHandlerOptions {
    /// Upper bound on sessions held at once by the batch loop. Single
    /// dispatch holds one session at a time.
    pub max_concurrent_sessions: usize,

    pub auto_complete: bool,

    /// How long a session lock is renewed at most. Zero disables renewal.
    #[serde(with = "timespan")]
    pub max_auto_renew_duration: Duration,

    /// How long to wait for the next message of an accepted session, and for
    /// a session to become available, before giving up on it.
    #[serde(with = "timespan")]
    pub message_wait_timeout: Duration,
}

impl Default for SessionHandlerOptions {
    fn default() -> Self {
        // ---
        Self {
            max_concurrent_sessions: 2000,
            auto_complete: true,
            max_auto_renew_duration: Duration::from_secs(5 * 60),
            message_wait_timeout: Duration::from_secs(60),
        }
    }
}

/// Settings for batch dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchOptions {
    /// Largest batch handed to one invocation.
    pub max_message_count: usize,

    /// How long one receive (or session accept) call waits.
    #[serde(with = "timespan")]
    pub operation_timeout: Duration,

    /// Complete (on success) or abandon (on failure) the whole batch.
    pub auto_complete: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        // ---
        Self {
            max_message_count: 1000,
            operation_timeout: Duration::from_secs(60),
            auto_complete: true,
        }
    }
}

/// Complete listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerOptions {
    /// Messages the broker client may fetch ahead of demand.
    pub prefetch_count: u32,

    /// Upper bound on how early before expiry a lock is renewed.
    #[serde(with = "timespan")]
    pub max_renew_buffer: Duration,

    pub message_handler: MessageHandlerOptions,
    pub session_handler: SessionHandlerOptions,
    pub batch: BatchOptions,

    /// Backoff between failed receive or accept calls, and between failed
    /// lock renewals.
    pub receive_retry: RetryConfig,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        // ---
        Self {
            prefetch_count: 0,
            max_renew_buffer: DEFAULT_MAX_RENEW_BUFFER,
            message_handler: MessageHandlerOptions::default(),
            session_handler: SessionHandlerOptions::default(),
            batch: BatchOptions::default(),
            receive_retry: RetryConfig::default(),
        }
    }
}

impl ListenerOptions {
    // ---
    /// Load options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Render the options as indented JSON.
    pub fn format(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }

    /// Reject settings that would stall a listener.
    pub fn validate(&self) -> Result<()> {
        // ---
        let invalid = |what: &str| Err(TriggerError::InvalidConfig(what.to_owned()));

        if self.message_handler.max_concurrent_calls == 0 {
            return invalid("messageHandler.maxConcurrentCalls must be at least 1");
        }
        if self.message_handler.max_wait_time.is_zero() {
            return invalid("messageHandler.maxWaitTime must be greater than zero");
        }
        if self.session_handler.max_concurrent_sessions == 0 {
            return invalid("sessionHandler.maxConcurrentSessions must be at least 1");
        }
        if self.session_handler.message_wait_timeout.is_zero() {
            return invalid("sessionHandler.messageWaitTimeout must be greater than zero");
        }
        if self.batch.max_message_count == 0 {
            return invalid("batch.maxMessageCount must be at least 1");
        }
        if self.batch.operation_timeout.is_zero() {
            return invalid("batch.operationTimeout must be greater than zero");
        }
        if self.receive_retry.multiplier < 1.0 {
            return invalid("receiveRetry.multiplier must be at least 1.0");
        }
        Ok(())
    }

    pub(crate) fn message_renewal(&self) -> Option<RenewalSettings> {
        self.renewal(self.message_handler.max_auto_renew_duration)
    }

    pub(crate) fn session_renewal(&self) -> Option<RenewalSettings> {
        self.renewal(self.session_handler.max_auto_renew_duration)
    }

    fn renewal(&self, max_duration: Duration) -> Option<RenewalSettings> {
        // ---
        if max_duration.is_zero() {
            return None;
        }
        Some(RenewalSettings {
            max_duration,
            max_buffer: self.max_renew_buffer,
            retry: self.receive_retry.clone(),
        })
    }
}

/// Serde adapter for `hh:mm:ss[.fffffff]` durations.
pub(crate) mod timespan {
    // ---
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const SECS_PER_DAY: u64 = 86_400;

    pub(crate) fn format(duration: Duration) -> String {
        // ---
        let total = duration.as_secs();
        let days = total / SECS_PER_DAY;
        let hours = (total % SECS_PER_DAY) / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;

        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{days}."));
        }
        out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
        let ticks = duration.subsec_nanos() / 100;
        if ticks > 0 {
            out.push_str(&format!(".{ticks:07}"));
        }
        out
    }

    pub(crate) fn parse(text: &str) -> Result<Duration, String> {
        // ---
        let text = text.trim();
        let bad = || format!("invalid duration '{text}', expected [d.]hh:mm:ss[.fffffff]");

        let mut parts = text.split(':');
        let (Some(head), Some(minutes), Some(tail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };

        let (days, hours) = match head.split_once('.') {
            Some((days, hours)) => (days, hours),
            None => ("0", head),
        };
        let (seconds, fraction) = match tail.split_once('.') {
            Some((seconds, fraction)) => (seconds, fraction),
            None => (tail, ""),
        };

        let number = |s: &str| s.parse::<u64>().map_err(|_| bad());
        let days = number(days)?;
        let hours = number(hours)?;
        let minutes = number(minutes)?;
        let seconds = number(seconds)?;
        if hours > 23 || minutes > 59 || seconds > 59 {
            return Err(bad());
        }

        let nanos = if fraction.is_empty() {
            0
        } else {
            if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            let padded = format!("{fraction:0<9}");
            padded.parse::<u32>().map_err(|_| bad())?
        };

        let secs = days * SECS_PER_DAY + hours * 3600 + minutes * 60 + seconds;
        Ok(Duration::new(secs, nanos))
    }

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*duration))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(D::Error::custom)
    }
}
