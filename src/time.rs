//! Monotonic time seam.
//!
//! Session expiry, handshake timeouts and discovery pacing all compare
//! against a monotonic clock. Runtimes take the clock as a trait so tests can
//! drive expiry without sleeping.

use std::time::Instant;

/// Source of monotonic time for the runtimes.
pub trait TimeSource {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u64;

    /// Monotonic microseconds since the same epoch. Used by clock sync.
    fn now_us(&self) -> u64;
}

/// Default clock backed by `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock for tests. Clones share the same instant, so a
/// test can hold one handle while the runtimes hold others.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1_000);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us
            .fetch_add(us, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_us() / 1_000
    }

    fn now_us(&self) -> u64 {
        self.now_us.load(std::sync::atomic::Ordering::SeqCst)
    }
}
