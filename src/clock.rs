//! Wall-clock helpers.
//!
//! Scheduler and ledger bookkeeping is expressed in unix milliseconds so
//! that every time-dependent operation can also be driven with an explicit
//! `now` in tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub type UnixMillis = u64;

/// Current wall-clock time in unix milliseconds.
///
/// Returns `0` if the system clock is set before the epoch.
///
/// # Panics
///
/// This function never panics.
pub fn now_millis() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert whole seconds to milliseconds, saturating on overflow.
pub fn secs(s: u64) -> UnixMillis {
    s.saturating_mul(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_secs_saturates() {
        assert_eq!(secs(2), 2000);
        assert_eq!(secs(u64::MAX), u64::MAX);
    }
}
