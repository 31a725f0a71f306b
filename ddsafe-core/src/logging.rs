//! Helpers for keeping `tracing` output readable during long transfers.
//!
//! Subscriber setup belongs to the front-end; the library only emits events.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NEVER_LOGGED: u64 = u64::MAX;

/// Rate limiter for repetitive log events such as progress samples.
///
/// ```
/// use ddsafe_core::logging::LogThrottle;
/// use std::time::Duration;
///
/// let throttle = LogThrottle::new(Duration::from_secs(5));
/// assert!(throttle.should_log());
/// assert!(!throttle.should_log());
/// ```
pub struct LogThrottle {
    interval_ms: u64,
    last_log_ms: AtomicU64,
    start: Instant,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// True at most once per interval. Safe to share between threads.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        if last != NEVER_LOGGED && now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        // Losing the race means another thread just logged.
        self.last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}
