//! Retry backoff for failed verification jobs.
//!
//! Failed jobs are retried with exponential backoff: one minute for the
//! first retry, doubling per retry, capped at fifteen minutes. The returned
//! delay is the time remaining until the next attempt is due, measured from
//! the slot's last transition, so a reconcile that arrives late gets zero
//! and retries immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Delay before the first retry.
const BASE_DELAY: Duration = Duration::from_secs(60);

/// Upper bound on any single retry delay.
const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Compute the remaining delay before retry number `retry_count` is due.
///
/// `retry_count` counts failures so far: `1` means the first retry. Returns
/// zero for `retry_count < 1`. Without a transition time the full nominal
/// delay is returned. The result is never negative; a transition time ahead
/// of `now` (clock skew) extends the wait by at most the skew.
pub fn calculate_backoff(
    retry_count: u32,
    transition_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    if retry_count < 1 {
        return Duration::ZERO;
    }
    // 2^4 minutes is already past the cap, so larger exponents are moot.
    let exponent = (retry_count - 1).min(4);
    let nominal = BASE_DELAY.saturating_mul(1 << exponent).min(MAX_DELAY);

    let Some(transition) = transition_time else {
        return nominal;
    };

    let remaining = chrono::Duration::from_std(nominal).unwrap_or(chrono::Duration::zero())
        + transition.signed_duration_since(now);
    remaining.to_std().unwrap_or(Duration::ZERO)
}
