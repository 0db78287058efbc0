//! Transport adapter: drives HTTP attempts concurrently on behalf of the
//! scheduler without ever spawning work off the scheduler's own task.
//!
//! Stands in for a libcurl multi-handle. Rather than reimplement
//! readiness-fd plumbing, attempts are modeled as futures held in a
//! [`tokio::task::JoinSet`] and polled cooperatively by [`Transport::poll`];
//! nothing here is ever `tokio::spawn`ed onto another worker thread, so the
//! single-task ownership the scheduler depends on still holds.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::{AbortHandle, JoinSet};
use tracing::debug;

use crate::error::OrchError;
use crate::request::{HttpVersion, Method, RequestId};
use crate::sink::Sink;

/// Everything a transport attempt needs, extracted from a `Request` so it
/// can be moved into a detached future.
pub struct TransferSpec {
    pub request_id: RequestId,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
    pub max_download_size: Option<u64>,
    pub low_speed_limit: Option<u64>,
    pub low_speed_time: Option<Duration>,
    pub http_version: HttpVersion,
    pub sink: std::sync::Arc<tokio::sync::Mutex<Box<dyn Sink>>>,
    pub on_write: Option<std::sync::Arc<dyn Fn(&[u8]) + Send + Sync>>,
}

/// Outcome of one transport attempt.
pub struct TransferOutcome {
    pub request_id: RequestId,
    pub result: Result<u16, OrchError>,
    pub bytes_downloaded: u64,
}

/// Abstraction over the HTTP engine driving attempts, so tests can script
/// deterministic outcomes without a network.
#[async_trait]
pub trait Transport: Send {
    /// Begin a new attempt. Must not block; the future runs cooperatively
    /// inside [`Transport::poll`].
    fn add(&mut self, spec: TransferSpec);

    /// Cancel an in-flight attempt, if present. No-op if unknown/finished.
    fn remove(&mut self, request_id: RequestId);

    /// Drain any attempts that have already finished without waiting.
    fn perform(&mut self) -> Vec<TransferOutcome>;

    /// Wait up to `timeout` for at least one attempt to finish, returning
    /// the (possibly empty) set that completed.
    async fn poll(&mut self, timeout: Duration) -> Vec<TransferOutcome>;

    /// Number of attempts currently in flight.
    fn in_flight(&self) -> usize;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    http3_client: Option<reqwest::Client>,
    join_set: JoinSet<TransferOutcome>,
    abort_handles: HashMap<RequestId, AbortHandle>,
    completed: Vec<TransferOutcome>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_clients(
            reqwest::Client::builder().build().expect("failed to build default reqwest client"),
            None,
        )
    }

    pub fn with_clients(client: reqwest::Client, http3_client: Option<reqwest::Client>) -> Self {
        Self {
            client,
            http3_client,
            join_set: JoinSet::new(),
            abort_handles: HashMap::new(),
            completed: Vec::new(),
        }
    }

    fn client_for(&self, version: HttpVersion) -> &reqwest::Client {
        match version {
            HttpVersion::Http3 => self.http3_client.as_ref().unwrap_or(&self.client),
            _ => &self.client,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_attempt(client: reqwest::Client, spec: TransferSpec) -> TransferOutcome {
    let request_id = spec.request_id;
    let outcome = run_attempt_inner(client, &spec).await;
    match outcome {
        Ok((status, bytes_downloaded)) => {
            TransferOutcome { request_id, result: Ok(status), bytes_downloaded }
        }
        Err((err, bytes_downloaded)) => TransferOutcome { request_id, result: Err(err), bytes_downloaded },
    }
}

/// Average throughput over `elapsed` falls below `limit_bytes_per_sec`
/// (spec.md §3, §4.F `low_speed_limit`/`low_speed_time`). `limit_bytes_per_sec
/// == 0` means "stalled entirely" rather than "no limit" — callers only
/// invoke this once `spec.low_speed_time` has actually elapsed.
fn is_below_low_speed_limit(bytes_since_checkpoint: u64, elapsed: Duration, limit_bytes_per_sec: u64) -> bool {
    let speed = bytes_since_checkpoint as f64 / elapsed.as_secs_f64();
    speed < limit_bytes_per_sec as f64
}

async fn run_attempt_inner(
    client: reqwest::Client,
    spec: &TransferSpec,
) -> Result<(u16, u64), (OrchError, u64)> {
    let mut builder = client.request(spec.method.as_reqwest(), &spec.url);
    for (name, value) in &spec.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &spec.body {
        builder = builder.body(body.clone());
    }
    builder = builder.timeout(spec.transfer_timeout);

    let connect_fut = tokio::time::timeout(spec.connect_timeout, builder.send());
    let response = match connect_fut.await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            return Err((OrchError::Transport { code: -1, message: e.to_string() }, 0));
        }
        Err(_) => {
            return Err((
                OrchError::Timeout { elapsed: spec.connect_timeout, timeout: spec.connect_timeout },
                0,
            ));
        }
    };

    let status = response.status().as_u16();
    let content_length = response.content_length();

    if let (Some(limit), Some(len)) = (spec.max_download_size, content_length) {
        if len > limit {
            return Err((
                OrchError::SizeExceeded { limit, content_length: Some(len) },
                0,
            ));
        }
    }

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut low_speed_checkpoint = std::time::Instant::now();
    let mut low_speed_checkpoint_bytes: u64 = 0;
    {
        let mut sink = spec.sink.lock().await;
        sink.init().await;
    }
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = match chunk {
            Ok(c) => c,
            Err(e) => {
                return Err((OrchError::Transport { code: -2, message: e.to_string() }, downloaded));
            }
        };
        downloaded += chunk.len() as u64;
        if let Some(limit) = spec.max_download_size {
            if downloaded > limit {
                return Err((
                    OrchError::SizeExceeded { limit, content_length },
                    downloaded,
                ));
            }
        }
        if let Some(time) = spec.low_speed_time {
            let elapsed = low_speed_checkpoint.elapsed();
            if elapsed >= time {
                let limit = spec.low_speed_limit.unwrap_or(0);
                let bytes_since = downloaded - low_speed_checkpoint_bytes;
                if is_below_low_speed_limit(bytes_since, elapsed, limit) {
                    return Err((
                        OrchError::Transport {
                            code: -4,
                            message: format!(
                                "transfer stalled below {limit} bytes/sec for {elapsed:?}"
                            ),
                        },
                        downloaded,
                    ));
                }
                low_speed_checkpoint = std::time::Instant::now();
                low_speed_checkpoint_bytes = downloaded;
            }
        }
        if let Some(on_write) = &spec.on_write {
            on_write(&chunk);
        }
        let accepted = {
            let mut sink = spec.sink.lock().await;
            sink.write(&chunk).await
        };
        match accepted {
            Ok(n) if n == chunk.len() => {}
            _ => {
                return Err((
                    OrchError::SizeExceeded { limit: downloaded, content_length },
                    downloaded,
                ));
            }
        }
    }

    Ok((status, downloaded))
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn add(&mut self, spec: TransferSpec) {
        let request_id = spec.request_id;
        let client = self.client_for(spec.http_version).clone();
        let handle = self.join_set.spawn(run_attempt(client, spec));
        self.abort_handles.insert(request_id, handle);
    }

    fn remove(&mut self, request_id: RequestId) {
        if let Some(handle) = self.abort_handles.remove(&request_id) {
            handle.abort();
        }
    }

    fn perform(&mut self) -> Vec<TransferOutcome> {
        while let Some(res) = self.join_set.try_join_next() {
            match res {
                Ok(outcome) => {
                    self.abort_handles.remove(&outcome.request_id);
                    self.completed.push(outcome);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => debug!(error = %e, "transfer task panicked"),
            }
        }
        std::mem::take(&mut self.completed)
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<TransferOutcome> {
        let mut out = self.perform();
        if !out.is_empty() {
            return out;
        }
        if self.join_set.is_empty() {
            tokio::time::sleep(timeout).await;
            return out;
        }
        match tokio::time::timeout(timeout, self.join_set.join_next()).await {
            Ok(Some(Ok(outcome))) => {
                self.abort_handles.remove(&outcome.request_id);
                out.push(outcome);
            }
            Ok(Some(Err(e))) if !e.is_cancelled() => debug!(error = %e, "transfer task panicked"),
            Ok(Some(Err(_))) | Ok(None) | Err(_) => {}
        }
        out.extend(self.perform());
        out
    }

    fn in_flight(&self) -> usize {
        self.abort_handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_transport_has_nothing_in_flight() {
        let transport = ReqwestTransport::new();
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn below_low_speed_limit_when_throughput_is_short_of_the_target() {
        assert!(is_below_low_speed_limit(500, Duration::from_secs(5), 200));
    }

    #[test]
    fn at_or_above_low_speed_limit_is_not_a_violation() {
        assert!(!is_below_low_speed_limit(1_000, Duration::from_secs(5), 200));
        assert!(!is_below_low_speed_limit(1_000, Duration::from_secs(1), 1_000));
    }

    #[test]
    fn zero_bytes_since_checkpoint_is_always_a_violation_once_a_limit_is_set() {
        assert!(is_below_low_speed_limit(0, Duration::from_secs(5), 1));
    }
}
