use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over wall-clock time, injectable for tests.
///
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Clock returning a fixed instant. Useful for deterministic trace records.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl ClockSource for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

/// Floors at zero and rounds to 3 decimal places.
#[must_use]
pub fn round_millis(ms: f64) -> f64 {
    if ms.is_nan() || ms <= 0.0 {
        return 0.0;
    }
    (ms * 1000.0).round() / 1000.0
}

/// Elapsed milliseconds of a `Duration`, rounded with [`round_millis`].
#[must_use]
pub fn duration_millis(elapsed: std::time::Duration) -> f64 {
    round_millis(elapsed.as_secs_f64() * 1000.0)
}
