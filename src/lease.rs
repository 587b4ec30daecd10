//! Lease clock.
//!
//! Decides how long to wait before renewing a lock that expires at a given
//! instant. Short leases are renewed at their half-life; long leases are
//! renewed `max_buffer` before they expire.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Below this much remaining lease, renew immediately.
pub const MIN_RENEW_WINDOW: Duration = Duration::from_millis(400);

/// Default upper bound on how early a renewal is attempted.
pub const DEFAULT_MAX_RENEW_BUFFER: Duration = Duration::from_secs(10);

/// Delay before the next renewal of a lock expiring at `locked_until`.
///
/// With `remaining = locked_until - now`:
///
/// - `remaining < 400ms` (including already expired): zero
/// - otherwise `remaining - min(remaining / 2, max_buffer)`
pub fn renew_after(locked_until: DateTime<Utc>, now: DateTime<Utc>, max_buffer: Duration) -> Duration {
    // ---
    let remaining = match (locked_until - now).to_std() {
        Ok(remaining) => remaining,
        Err(_) => return Duration::ZERO,
    };

    if remaining < MIN_RENEW_WINDOW {
        return Duration::ZERO;
    }

    let buffer = (remaining / 2).min(max_buffer);
    remaining - buffer
}

/// [`renew_after`] measured from the current time.
pub fn renew_after_now(locked_until: DateTime<Utc>, max_buffer: Duration) -> Duration {
    renew_after(locked_until, Utc::now(), max_buffer)
}
