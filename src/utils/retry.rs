//! Backoff helpers for the UDP listener.
//!
//! Uses `backon` for the bounded same-port bind retry.

use std::time::Duration;

use backon::ConstantBuilder;

/// Constant-delay backoff for re-trying a bind on the same port.
///
/// `attempts` counts the first try, so `attempts = 3` yields two retries.
pub fn bind_backoff(attempts: u32, delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(attempts.saturating_sub(1) as usize)
}

/// Delay before the next receive after a failure.
///
/// Short until `threshold` consecutive failures have been seen, long after.
pub fn error_delay(consecutive_errors: u32, threshold: u32, short: Duration, long: Duration) -> Duration {
    if consecutive_errors >= threshold {
        long
    } else {
        short
    }
}
