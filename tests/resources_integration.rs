//! Resource dependency graph exercised the way a real caller would use
//! it: one task drives the scheduler via `run`, another publishes the
//! dependency later from across a `RegistryHandle`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqorch::{
    Loop, NullSink, Request, RequestId, RetryDecision, TransferOutcome, TransferSpec, Transport,
};

struct EchoTransport {
    outstanding: Vec<RequestId>,
}

#[async_trait]
impl Transport for EchoTransport {
    fn add(&mut self, spec: TransferSpec) {
        self.outstanding.push(spec.request_id);
    }
    fn remove(&mut self, request_id: RequestId) {
        self.outstanding.retain(|id| *id != request_id);
    }
    fn perform(&mut self) -> Vec<TransferOutcome> {
        std::mem::take(&mut self.outstanding)
            .into_iter()
            .map(|request_id| TransferOutcome { request_id, result: Ok(200), bytes_downloaded: 0 })
            .collect()
    }
    async fn poll(&mut self, _timeout: Duration) -> Vec<TransferOutcome> {
        self.perform()
    }
    fn in_flight(&self) -> usize {
        self.outstanding.len()
    }
}

#[tokio::test]
async fn request_blocks_until_cross_task_publish_then_completes() {
    let mut lp = Loop::with_transport_and_clock(
        EchoTransport { outstanding: Vec::new() },
        Arc::new(reqorch::MonotonicClock::default()),
    );
    let token = lp.declare_resource("oauth-token");
    let resources = lp.handle().resources();

    let completed = Arc::new(AtomicUsize::new(0));
    let completed_cb = completed.clone();
    lp.submit(
        Request::builder("https://example.com")
            .depends_on(token)
            .sink(NullSink)
            .on_complete(move |_| {
                completed_cb.fetch_add(1, Ordering::SeqCst);
                RetryDecision::Terminal
            })
            .build(),
    );

    let run_task = tokio::spawn(async move {
        lp.run().await;
    });

    // Give the loop a chance to observe the dependency as blocked before
    // publishing it from this task.
    tokio::time::sleep(Duration::from_millis(20)).await;
    resources.publish_async(token, Some(Arc::new("secret-token".to_string()))).await;

    tokio::time::timeout(Duration::from_secs(2), run_task)
        .await
        .expect("loop must reach idle once the dependency resolves")
        .unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn publishing_a_failed_dependency_fails_every_waiter() {
    let mut lp = Loop::with_transport_and_clock(
        EchoTransport { outstanding: Vec::new() },
        Arc::new(reqorch::MonotonicClock::default()),
    );
    let token = lp.declare_resource("expired-lease");
    let resources = lp.handle().resources();

    let failures = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let failures_cb = failures.clone();
        lp.submit(
            Request::builder("https://example.com")
                .depends_on(token)
                .sink(NullSink)
                .on_failure(move |_, _| {
                    failures_cb.fetch_add(1, Ordering::SeqCst);
                    RetryDecision::Terminal
                })
                .build(),
        );
    }

    let run_task = tokio::spawn(async move {
        lp.run().await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    resources.publish_async(token, None).await;

    tokio::time::timeout(Duration::from_secs(2), run_task).await.expect("loop must go idle").unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 3);
}
