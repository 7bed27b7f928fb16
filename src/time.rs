//! Monotonic and wall-clock time sources.
//!
//! Scheduling decisions (delayed tasks, idle deadlines, job back-off) are all
//! expressed in terms of [`TimeSource`] rather than calling `Instant::now()`
//! directly, so tests can substitute a deterministic clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic seconds and wall-clock milliseconds.
///
/// The default implementation wraps `std::time::Instant`/`SystemTime`. Tests
/// that need deterministic delay ordering can swap in [`StubTimeSource`].
pub trait TimeSource: Send + Sync {
    /// Seconds since an arbitrary but fixed epoch, monotonically increasing.
    fn monotonic_seconds(&self) -> f64;

    /// Milliseconds since the Unix epoch.
    fn wall_clock_millis(&self) -> f64;
}

/// Real clock, backed by the OS monotonic and wall clocks.
#[derive(Debug, Default)]
pub struct SystemTimeSource {
    start: once_cell::sync::OnceCell<Instant>,
}

impl SystemTimeSource {
    /// Create a new system time source.
    pub fn new() -> Self {
        Self {
            start: once_cell::sync::OnceCell::new(),
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn monotonic_seconds(&self) -> f64 {
        let start = self.start.get_or_init(Instant::now);
        start.elapsed().as_secs_f64()
    }

    fn wall_clock_millis(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as f64
    }
}

/// A deterministic clock for tests. `monotonic_seconds` only advances when
/// [`StubTimeSource::advance`] is called.
#[derive(Debug, Default)]
pub struct StubTimeSource {
    // Stored as millis in an atomic so `&self` methods can advance the clock
    // from inside closures shared across threads.
    micros: AtomicU64,
}

impl StubTimeSource {
    /// Create a stub clock starting at time zero.
    pub fn new() -> Self {
        Self {
            micros: AtomicU64::new(0),
        }
    }

    /// Advance the stub clock by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let delta = (seconds * 1_000_000.0) as u64;
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }
}

impl TimeSource for StubTimeSource {
    fn monotonic_seconds(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    fn wall_clock_millis(&self) -> f64 {
        self.monotonic_seconds() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_is_monotonic() {
        let clock = SystemTimeSource::new();
        let a = clock.monotonic_seconds();
        let b = clock.monotonic_seconds();
        assert!(b >= a);
    }

    #[test]
    fn stub_time_only_advances_explicitly() {
        let clock = StubTimeSource::new();
        assert_eq!(clock.monotonic_seconds(), 0.0);
        clock.advance(1.5);
        assert!((clock.monotonic_seconds() - 1.5).abs() < 1e-9);
    }
}
