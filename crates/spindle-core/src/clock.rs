//! Monotonic nanosecond time source.
//!
//! The event loop samples the clock once at the top of every cycle and
//! re-samples every `clock_sample_interval` tasks inside a slice, so the
//! cost of `Instant::now()` is amortised over task execution.

use std::time::Instant;

/// Monotonic clock reporting nanoseconds since its creation.
///
/// Readings never go backwards and are unrelated to wall-clock time.
/// A `u64` nanosecond counter anchored at construction gives over 580
/// years of range, so overflow is not a practical concern.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Returns the current reading in nanoseconds since the anchor.
    #[inline]
    #[must_use]
    pub fn nanos(&self) -> u64 {
        // Instant elapsed is guaranteed monotone; the cast is lossless for
        // any realistic process lifetime.
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monotone() {
        let clock = Clock::new();
        let a = clock.nanos();
        let b = clock.nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_advances() {
        let clock = Clock::new();
        let a = clock.nanos();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.nanos();
        assert!(b - a >= 1_000_000, "expected >= 1ms progress, got {}ns", b - a);
    }
}
