//! Per-key rate limiting end to end through the scheduler: a 429 response
//! opens a backoff window that the request only leaves once the clock
//! advances past it, then a following retry succeeds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqorch::{Loop, ManualClock, NullSink, Request, RequestId, TransferOutcome, TransferSpec, Transport};

/// Replies with whatever status is queued in the shared `script` map for a
/// request id, defaulting to 200. The map is shared with the test so
/// statuses can be scripted before the transport is handed to `Loop`.
struct ScriptedTransport {
    script: Arc<Mutex<HashMap<RequestId, u16>>>,
    outstanding: Arc<Mutex<Vec<RequestId>>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn add(&mut self, spec: TransferSpec) {
        self.outstanding.lock().unwrap().push(spec.request_id);
    }
    fn remove(&mut self, request_id: RequestId) {
        self.outstanding.lock().unwrap().retain(|id| *id != request_id);
    }
    fn perform(&mut self) -> Vec<TransferOutcome> {
        let ids: Vec<RequestId> = std::mem::take(&mut *self.outstanding.lock().unwrap());
        let mut script = self.script.lock().unwrap();
        ids.into_iter()
            .map(|request_id| {
                let status = script.remove(&request_id).unwrap_or(200);
                TransferOutcome { request_id, result: Ok(status), bytes_downloaded: 0 }
            })
            .collect()
    }
    async fn poll(&mut self, _timeout: Duration) -> Vec<TransferOutcome> {
        self.perform()
    }
    fn in_flight(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

#[tokio::test]
async fn a_429_reschedules_instead_of_calling_on_failure() {
    let clock = Arc::new(ManualClock::new());
    let script = Arc::new(Mutex::new(HashMap::new()));
    let mut lp = Loop::with_transport_clock_and_sleeper(
        ScriptedTransport { script: script.clone(), outstanding: Arc::new(Mutex::new(Vec::new())) },
        clock.clone(),
        reqorch::InstantSleeper,
    );
    lp.rate_manager().set_limit("svc", 10, 0.0);

    let req = Request::builder("https://example.com").rate_limit("svc", false).sink(NullSink).build();
    let id = req.id;
    script.lock().unwrap().insert(id, 429);
    lp.submit(req);

    lp.tick().await; // starts the attempt, transport reports 429
    lp.tick().await; // handles the 429, reschedules into rate_limited

    // Never reached on_failure/on_complete: spec.md's resolved open question
    // is that a 429 never invokes a user callback, only reschedules.
    assert_eq!(lp.metrics().failed, 0);
    assert_eq!(lp.metrics().completed, 0);
    assert_eq!(lp.metrics().total, 1);

    // Advance well past the 1s initial backoff window; the retry (now
    // unscripted, so it defaults to 200) should complete successfully.
    clock.advance(Duration::from_millis(1100));
    lp.tick().await; // promotes the retry
    lp.tick().await; // starts and completes it

    assert_eq!(lp.metrics().completed, 1);
    assert_eq!(lp.metrics().failed, 0);
}

/// Accepts attempts and remembers every id ever added, but never completes
/// one, so whatever gets admitted past the rate limiter stays admitted —
/// making the admitted count directly observable.
struct NeverCompletingTransport {
    added: Arc<Mutex<Vec<RequestId>>>,
}

#[async_trait]
impl Transport for NeverCompletingTransport {
    fn add(&mut self, spec: TransferSpec) {
        self.added.lock().unwrap().push(spec.request_id);
    }
    fn remove(&mut self, _request_id: RequestId) {}
    fn perform(&mut self) -> Vec<TransferOutcome> {
        Vec::new()
    }
    async fn poll(&mut self, _timeout: Duration) -> Vec<TransferOutcome> {
        Vec::new()
    }
    fn in_flight(&self) -> usize {
        self.added.lock().unwrap().len()
    }
}

#[tokio::test]
async fn rate_limited_key_throttles_concurrent_requests_by_key() {
    let clock = Arc::new(ManualClock::new());
    let added = Arc::new(Mutex::new(Vec::new()));
    let mut lp = Loop::with_transport_clock_and_sleeper(
        NeverCompletingTransport { added: added.clone() },
        clock,
        reqorch::InstantSleeper,
    );
    lp.rate_manager().set_limit("provider", 1, 0.0);

    for _ in 0..3 {
        lp.submit(Request::builder("https://example.com").rate_limit("provider", false).sink(NullSink).build());
    }

    // Only one of the three can ever be admitted against the same key: the
    // transport never completes it, so the concurrency slot never frees up
    // for the other two to follow.
    for _ in 0..5 {
        lp.tick().await;
    }
    assert_eq!(added.lock().unwrap().len(), 1, "rate limit must cap concurrent admission by key");
    assert_eq!(lp.metrics().total, 3);
}
