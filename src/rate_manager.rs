//! Per-key rate limiting with high-priority preemption and 429 backoff.
//!
//! Structurally this is the named-registry pattern from
//! `circuit_breaker_registry.rs` (`Arc<Mutex<HashMap<String, _>>>`) crossed
//! with the token-bucket refill arithmetic from `rate_limit/store.rs`'s
//! `InMemoryTokenStore`, collapsed onto a single `Mutex` instead of a CAS
//! loop: the bucket table is small and mutated only from the scheduler
//! tick plus occasional `set_limit`/`handle_429` calls, so optimistic
//! retries would only add complexity without a measurable win.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;

/// Per-key token bucket and live counters.
#[derive(Debug, Clone)]
struct Bucket {
    max_concurrent: u32,
    max_rps: f64,
    tokens: f64,
    last_refill_nanos: u64,
    current_requests: u32,
    high_priority_waiting: u32,
    backoff_seconds: f64,
    backoff_until_nanos: u64,
    last_success_nanos: u64,
}

impl Bucket {
    fn new(max_concurrent: u32, max_rps: f64, now_nanos: u64) -> Self {
        Self {
            max_concurrent,
            max_rps,
            tokens: max_rps.max(1.0),
            last_refill_nanos: now_nanos,
            current_requests: 0,
            high_priority_waiting: 0,
            backoff_seconds: INITIAL_BACKOFF_SECS,
            backoff_until_nanos: 0,
            last_success_nanos: now_nanos,
        }
    }

    fn refill(&mut self, now_nanos: u64) {
        if self.max_rps <= 0.0 {
            return;
        }
        let elapsed_secs = now_nanos.saturating_sub(self.last_refill_nanos) as f64 / 1_000_000_000.0;
        if elapsed_secs <= 0.0 {
            return;
        }
        let cap = self.max_rps.max(1.0);
        self.tokens = (self.tokens + elapsed_secs * self.max_rps).min(cap);
        self.last_refill_nanos = now_nanos;
    }
}

/// Outcome of a 429 response, fed back into [`RateManager::handle_429`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAfter {
    pub seconds: Option<f64>,
}

/// spec.md §3 `backoff_seconds (int, default 1)`.
const INITIAL_BACKOFF_SECS: f64 = 1.0;
/// spec.md §4.A: a success within this window of the last one resets
/// backoff to 1 instead of doubling it.
const SUCCESS_RESET_WINDOW_SECS: f64 = 2.0;
/// spec.md §4.A: "doubles backoff (capped at 60s)".
const MAX_BACKOFF_SECS: f64 = 60.0;

/// The rate manager: a named table of token buckets shared by every request
/// key ("api.example.com", a provider name, whatever the caller chooses).
/// A key with no registered limit never throttles — `can_proceed` is a
/// no-op pass for unknown keys, matching the spec's "absent key imposes no
/// limit" rule.
#[derive(Clone)]
pub struct RateManager<C: Clock> {
    clock: Arc<C>,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl<C: Clock> RateManager<C> {
    pub fn new(clock: Arc<C>) -> Self {
        Self { clock, buckets: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Install or replace the limit for `key`. Existing in-flight counts
    /// carry over; the token bucket resets to full.
    pub fn set_limit(&self, key: impl Into<String>, max_concurrent: u32, max_rps: f64) {
        let now = self.clock.now_nanos();
        let mut buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        let key = key.into();
        let current_requests = buckets.get(&key).map(|b| b.current_requests).unwrap_or(0);
        let mut bucket = Bucket::new(max_concurrent, max_rps, now);
        bucket.current_requests = current_requests;
        buckets.insert(key, bucket);
    }

    /// Remove any limit on `key`; future calls treat it as unlimited.
    pub fn clear_limit(&self, key: &str) {
        self.buckets.lock().expect("rate manager mutex poisoned").remove(key);
    }

    /// Whether a request against `key` may proceed right now.
    ///
    /// `high_priority` requests bypass the concurrency cap (but not an
    /// active 429 backoff window) once at least one has been waiting;
    /// see [`RateManager::mark_waiting_high_priority`].
    pub fn can_proceed(&self, key: &str, high_priority: bool) -> bool {
        let now = self.clock.now_nanos();
        let mut buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        let Some(bucket) = buckets.get_mut(key) else { return true };

        if now < bucket.backoff_until_nanos {
            return false;
        }
        bucket.refill(now);

        let concurrency_ok = if high_priority {
            true
        } else {
            bucket.current_requests < bucket.max_concurrent
        };
        let tokens_ok = bucket.max_rps <= 0.0 || bucket.tokens >= 1.0;
        concurrency_ok && tokens_ok
    }

    /// Record that a request is now in flight against `key`, consuming one
    /// token. Call only after `can_proceed` returned `true`.
    pub fn start_request(&self, key: &str, high_priority: bool) {
        let mut buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        let Some(bucket) = buckets.get_mut(key) else { return };
        bucket.current_requests += 1;
        if bucket.max_rps > 0.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        }
        if high_priority && bucket.high_priority_waiting > 0 {
            bucket.high_priority_waiting -= 1;
        }
    }

    /// Declare a high-priority request is now queued waiting on `key`,
    /// allowing it to preempt the concurrency cap once admitted.
    pub fn mark_waiting_high_priority(&self, key: &str) {
        let mut buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.high_priority_waiting += 1;
        }
    }

    /// Record that an in-flight request against `key` finished (success or
    /// failure other than 429). spec.md §4.A: stamps `last_success` and
    /// resets `backoff_seconds` to 1.
    pub fn request_done(&self, key: &str, success: bool) {
        let now = self.clock.now_nanos();
        let mut buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        let Some(bucket) = buckets.get_mut(key) else { return };
        bucket.current_requests = bucket.current_requests.saturating_sub(1);
        if success {
            bucket.last_success_nanos = now;
            bucket.backoff_seconds = INITIAL_BACKOFF_SECS;
            bucket.backoff_until_nanos = 0;
        }
    }

    /// Record a 429 response against `key`, opening (or extending) a
    /// backoff window, and return the number of seconds until the next
    /// attempt may proceed (spec.md §4.A `handle_429(key) -> retry_in_seconds`).
    ///
    /// Per spec.md §4.A: if less than [`SUCCESS_RESET_WINDOW_SECS`] has
    /// elapsed since the last success, `backoff_seconds` resets to 1;
    /// otherwise it doubles, capped at [`MAX_BACKOFF_SECS`]. An explicit
    /// `retry_after` (from a server's `Retry-After` header) overrides the
    /// computed value and is not itself capped, since the server is
    /// authoritative about its own recovery time.
    pub fn handle_429(&self, key: &str, retry_after: RetryAfter) -> f64 {
        let now = self.clock.now_nanos();
        let mut buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        let Some(bucket) = buckets.get_mut(key) else { return 0.0 };
        bucket.current_requests = bucket.current_requests.saturating_sub(1);

        let secs = match retry_after.seconds {
            Some(s) if s > 0.0 => s,
            _ => {
                let elapsed_since_success =
                    now.saturating_sub(bucket.last_success_nanos) as f64 / 1_000_000_000.0;
                if elapsed_since_success < SUCCESS_RESET_WINDOW_SECS {
                    bucket.backoff_seconds = INITIAL_BACKOFF_SECS;
                } else {
                    bucket.backoff_seconds = (bucket.backoff_seconds * 2.0).min(MAX_BACKOFF_SECS);
                }
                bucket.backoff_seconds
            }
        };
        bucket.backoff_until_nanos = now + (secs * 1_000_000_000.0) as u64;
        secs
    }

    /// Nanoseconds until `key` next admits a request, or `None` if it would
    /// admit immediately (or carries no limit).
    pub fn next_available_nanos(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_nanos();
        let buckets = self.buckets.lock().expect("rate manager mutex poisoned");
        let bucket = buckets.get(key)?;
        if now < bucket.backoff_until_nanos {
            return Some(bucket.backoff_until_nanos - now);
        }
        if bucket.max_rps > 0.0 && bucket.tokens < 1.0 {
            let needed = (1.0 - bucket.tokens) / bucket.max_rps;
            return Some((needed * 1_000_000_000.0) as u64);
        }
        None
    }
}
