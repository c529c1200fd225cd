/// Time sources for the scheduler.
///
/// Everything time-related in the scheduler (lease expiry, retention
/// windows, minute alignment) works in unix milliseconds from a shared
/// `Clock` so that the expiry reaper and the history retention can be
/// tested against virtual time instead of real sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + 'static {
    /// Wall-clock time as unix milliseconds.
    fn now_ms(&self) -> u64;

    /// Wall-clock time as unix seconds.
    fn now_s(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta: u64) {
        self.advance_ms(delta * 1000);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000_000);
        assert_eq!(clock.now_ms(), 1_000_000);
        assert_eq!(clock.now_s(), 1_000);

        clock.advance_secs(36);
        assert_eq!(clock.now_ms(), 1_036_000);
    }

    #[test]
    fn system_clock_is_sane() {
        // Anything after 2020 counts as a working wall clock.
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
