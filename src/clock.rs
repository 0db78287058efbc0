//! Clock abstraction so the scheduler's timing can be faked in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Clock abstraction used by the rate manager and scheduler for all
/// monotonic timing decisions (token refill, retry scheduling, backoff).
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Nanoseconds since some fixed, clock-specific epoch. Only deltas are
    /// meaningful; never compare across clock instances.
    fn now_nanos(&self) -> u64;

    /// Milliseconds since the same epoch, derived from `now_nanos`.
    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Manually-advanced clock for deterministic tests. Starts at zero and only
/// moves when `advance` is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { nanos: AtomicU64::new(0) }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: std::time::Duration) {
        self.nanos.fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
