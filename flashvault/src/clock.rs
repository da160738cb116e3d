//! Time source for bounding maintenance work.

/// Monotonic millisecond clock.
///
/// The volume only ever compares differences of `now_ms` values, so any
/// monotonically non-decreasing source works: an RTOS tick counter, a
/// hardware timer, or the host clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by [`std::time::Instant`].
#[cfg(feature = "std")]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
