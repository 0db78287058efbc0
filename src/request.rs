//! Request descriptor and builder.
//!
//! `Request` is the single owner of everything an attempt needs; nothing
//! else in the crate ever holds a second owning reference to one. Scheduler
//! maps and the resource registry's waiter lists only ever store a
//! [`RequestId`] (`Copy`, no drop glue), so the ownership guarantee that the
//! original arena-allocator gave by convention (no dangling pointers after
//! destroy) falls out of the type system here: once `Loop` removes a
//! `Box<Request>` from its table, nothing in the crate can reach it again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::backoff::Backoff;
use crate::error::OrchError;
use crate::jitter::Jitter;
use crate::resources::ResourceId;
use crate::sink::{NullSink, Sink};

/// Monotonically increasing request handle, process-global and stable for
/// the request's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_request_id() -> RequestId {
    RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// HTTP method. A thin wrapper kept local rather than pulling in `http`
/// just for this; `reqwest::Method` is constructed from it at transport
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

/// What the scheduler should do after a terminal `on_complete`/`on_failure`
/// callback returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Destroy the request; no further attempts.
    Terminal,
    /// Schedule another attempt after the given delay.
    RetryIn(Duration),
    /// Defer to `on_retry`; if it returns `true`, retry using the default
    /// backoff/jitter policy, otherwise terminal.
    AskRetry,
}

/// HTTP/version preference for a request's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    #[default]
    Auto,
    Http2,
    Http3,
}

/// Relative scheduling priority. High-priority requests may preempt the
/// rate manager's concurrency cap; see `rate_manager::RateManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

type PrepareHook = Arc<dyn Fn(&mut Request) -> bool + Send + Sync>;
type RetryHook = Arc<dyn Fn(&Request, &OrchError) -> bool + Send + Sync>;
type CompleteHook = Arc<dyn Fn(&Request) -> RetryDecision + Send + Sync>;
type FailureHook = Arc<dyn Fn(&Request, &OrchError) -> RetryDecision + Send + Sync>;
type WriteHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Periodic re-submission policy, kept as an explicit scheduling state
/// (`State::Refresh`) distinct from retry bookkeeping; see spec.md §9's
/// design note on not conflating the two.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub interval: Duration,
    pub backoff_on_errors: bool,
}

/// A request descriptor: everything the scheduler needs to drive one
/// logical request (possibly across several retried attempts) to
/// completion.
pub struct Request {
    pub id: RequestId,
    pub(crate) url: String,
    pub(crate) method: Method,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Vec<u8>>,

    pub(crate) rate_key: Option<String>,
    pub(crate) rate_limit_high_priority: bool,
    pub(crate) priority: Priority,
    pub(crate) depends_on: Vec<ResourceId>,

    pub(crate) connect_timeout: Duration,
    pub(crate) transfer_timeout: Duration,
    pub(crate) max_download_size: Option<u64>,
    pub(crate) low_speed_limit: Option<u64>,
    pub(crate) low_speed_time: Option<Duration>,
    pub(crate) http_version: HttpVersion,

    pub(crate) max_retries: u32,
    pub(crate) unbounded_retries: bool,
    pub(crate) backoff: Backoff,
    pub(crate) jitter: Jitter,
    pub(crate) min_backoff_delay: Option<Duration>,
    pub(crate) max_backoff_delay: Option<Duration>,

    pub(crate) refresh: Option<RefreshPolicy>,

    pub(crate) on_prepare: Option<PrepareHook>,
    pub(crate) on_retry: Option<RetryHook>,
    pub(crate) on_complete: Option<CompleteHook>,
    pub(crate) on_failure: Option<FailureHook>,
    pub(crate) on_write: Option<WriteHook>,

    pub(crate) sink: Arc<AsyncMutex<Box<dyn Sink>>>,

    pub(crate) attempt: u32,
    pub(crate) bytes_downloaded: u64,
    pub(crate) last_error: Option<OrchError>,
    pub(crate) last_http_status: Option<u16>,
}

impl Request {
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(url)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn last_http_status(&self) -> Option<u16> {
        self.last_http_status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Whether this attempt is still within its retry budget (spec.md
    /// §4.C: `max_retries == -1` means unbounded; we spell that as an
    /// explicit flag rather than a sentinel so `max_retries` stays a plain
    /// `u32`).
    pub(crate) fn retries_remaining(&self) -> bool {
        self.unbounded_retries || self.attempt < self.max_retries
    }

    /// Default delay for the next attempt, derived from the configured
    /// backoff/jitter policy, clamped to `[min_backoff_delay,
    /// max_backoff_delay]` when set (used by `RetryDecision::AskRetry` and
    /// by the scheduler's positive-return-value path).
    pub(crate) fn default_retry_delay(&self) -> Duration {
        let delay = self.jitter.apply(self.backoff.delay(self.attempt as usize));
        let delay = if let Some(min) = self.min_backoff_delay { delay.max(min) } else { delay };
        if let Some(max) = self.max_backoff_delay { delay.min(max) } else { delay }
    }

    /// Replace every header line whose name matches (case-insensitive),
    /// appending a fresh entry if none matched. Per spec.md §4.C this
    /// leaves exactly one entry for `name`.
    pub(crate) fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder {
    url: String,
    method: Method,
    method_explicit: bool,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    json_root: Option<serde_json::Value>,
    rate_key: Option<String>,
    rate_limit_high_priority: bool,
    priority: Priority,
    depends_on: Vec<ResourceId>,
    connect_timeout: Duration,
    transfer_timeout: Duration,
    max_download_size: Option<u64>,
    low_speed_limit: Option<u64>,
    low_speed_time: Option<Duration>,
    http_version: HttpVersion,
    max_retries: u32,
    unbounded_retries: bool,
    backoff: Backoff,
    jitter: Jitter,
    min_backoff_delay: Option<Duration>,
    max_backoff_delay: Option<Duration>,
    refresh: Option<RefreshPolicy>,
    on_prepare: Option<PrepareHook>,
    on_retry: Option<RetryHook>,
    on_complete: Option<CompleteHook>,
    on_failure: Option<FailureHook>,
    on_write: Option<WriteHook>,
    sink: Box<dyn Sink>,
}

impl RequestBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            method_explicit: false,
            headers: Vec::new(),
            body: None,
            json_root: None,
            rate_key: None,
            rate_limit_high_priority: false,
            priority: Priority::Normal,
            depends_on: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(60),
            max_download_size: None,
            low_speed_limit: None,
            low_speed_time: None,
            http_version: HttpVersion::Auto,
            max_retries: 0,
            unbounded_retries: false,
            backoff: Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(30)),
            jitter: Jitter::Full,
            min_backoff_delay: None,
            max_backoff_delay: None,
            refresh: None,
            on_prepare: None,
            on_retry: None,
            on_complete: None,
            on_failure: None,
            on_write: None,
            sink: Box::new(NullSink),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self.method_explicit = true;
        self
    }

    /// Convenience constructors for the common shapes (spec.md §4.C
    /// `build_get`/`build_post`/`build_post_json`).
    pub fn build_get(self) -> Request {
        self.method(Method::Get).build()
    }

    pub fn build_post(self, body: impl Into<Vec<u8>>) -> Request {
        self.method(Method::Post).body(body).build()
    }

    pub fn build_post_json(self, value: serde_json::Value) -> Request {
        self.method(Method::Post).json_body(value).build()
    }

    /// Append a header line. Duplicates are allowed; see
    /// [`RequestBuilder::set_header`] for replace semantics.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn add_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header(name, value)
    }

    /// Replace every existing header line matching `name`
    /// (case-insensitive), appending one fresh entry if none matched.
    pub fn set_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// `printf`-style URL/body helpers are spelled with `format!` at the
    /// call site in Rust rather than a variadic C entry point; `urlf`/
    /// `bodyf` exist only as named aliases for readability at call sites
    /// translated from the spec's naming.
    pub fn urlf(self, url: impl Into<String>) -> Self {
        self.url(url)
    }

    pub fn bodyf(self, body: impl Into<Vec<u8>>) -> Self {
        self.body(body)
    }

    /// Set the body to `value` serialized as JSON and, unless a
    /// `Content-Type` header is already present, set it to
    /// `application/json`.
    pub fn json_body(mut self, value: serde_json::Value) -> Self {
        self.json_root = Some(value);
        self
    }

    pub fn json_bodyf(self, value: serde_json::Value) -> Self {
        self.json_body(value)
    }

    /// Key this request against in the rate manager. No key means no
    /// throttling. `high_priority` lets this request preempt the
    /// concurrency cap for the same key once one is already waiting; see
    /// `rate_manager::RateManager`.
    pub fn rate_limit(mut self, key: impl Into<String>, high_priority: bool) -> Self {
        self.rate_key = Some(key.into());
        self.rate_limit_high_priority = high_priority;
        self
    }

    /// Deprecated-style alias kept for call sites that only need the key.
    pub fn rate_key(mut self, key: impl Into<String>) -> Self {
        self.rate_key = Some(key.into());
        self
    }

    /// Apply a minimal browser-like header set: `User-Agent`, `Accept`,
    /// `Accept-Language`. Never touches `Sec-Fetch-*` or `Connection`
    /// per spec.md §4.C.
    pub fn apply_browser_profile(
        mut self,
        user_agent: Option<&str>,
        accept_language: Option<&str>,
    ) -> Self {
        const DEFAULT_UA: &str =
            "Mozilla/5.0 (compatible; reqorch/0.1; +https://github.com/flyingrobots/reqorch)";
        self = self.set_header("User-Agent", user_agent.unwrap_or(DEFAULT_UA).to_string());
        self = self.set_header("Accept", "*/*");
        if let Some(lang) = accept_language {
            self = self.set_header("Accept-Language", lang.to_string());
        }
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Block this request until every listed resource has published. If
    /// any publishes with no payload, the request terminates with
    /// [`OrchError::DependencyFailed`] without ever attempting a transfer.
    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    pub fn depend(self, id: ResourceId) -> Self {
        self.depends_on(id)
    }

    pub fn depend_many(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn max_download_size(mut self, bytes: u64) -> Self {
        self.max_download_size = Some(bytes);
        self
    }

    /// Abort the transfer if, over a rolling window of `time`, the average
    /// throughput stays below `limit_bytes_per_sec` (spec.md §3, §4.F
    /// `low_speed_limit`/`low_speed_time`).
    pub fn low_speed(mut self, limit_bytes_per_sec: u64, time: Duration) -> Self {
        self.low_speed_limit = Some(limit_bytes_per_sec);
        self.low_speed_time = Some(time);
        self
    }

    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.http_version = version;
        self
    }

    /// Shorthand for `http_version(HttpVersion::Http3)` /
    /// `http_version(HttpVersion::Auto)`.
    pub fn http3(self, prefer: bool) -> Self {
        self.http_version(if prefer { HttpVersion::Http3 } else { HttpVersion::Auto })
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Retry indefinitely (spec.md §3's `max_retries == -1`, spelled as a
    /// flag rather than a sentinel value).
    pub fn unbounded_retries(mut self) -> Self {
        self.unbounded_retries = true;
        self
    }

    /// Enable retries with `max_retries` attempts (spec.md §4.C:
    /// `max_retries` defaults to 0, opt-in only). Equivalent to
    /// `max_retries(n)`; exists so call sites can state intent explicitly,
    /// matching the spec's `enable_retries` entry point.
    pub fn enable_retries(self, max_retries: u32) -> Self {
        self.max_retries(max_retries)
    }

    pub fn min_backoff_delay(mut self, delay: Duration) -> Self {
        self.min_backoff_delay = Some(delay);
        self
    }

    pub fn max_backoff_delay(mut self, delay: Duration) -> Self {
        self.max_backoff_delay = Some(delay);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Re-enter the schedule after each terminal success at a fixed
    /// interval (spec.md §3 "Refresh"), as a distinct scheduling state
    /// rather than folded into retry bookkeeping (spec.md §9).
    pub fn enable_refresh(mut self, interval: Duration, backoff_on_errors: bool) -> Self {
        self.refresh = Some(RefreshPolicy { interval, backoff_on_errors });
        self
    }

    /// Called once per attempt, right before it's submitted to the
    /// transport. Return `false` to refuse the request entirely (it
    /// terminates with [`OrchError::PrepareRefused`] and no sink callbacks
    /// fire).
    pub fn on_prepare<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request) -> bool + Send + Sync + 'static,
    {
        self.on_prepare = Some(Arc::new(f));
        self
    }

    /// Called when `on_complete`/`on_failure` returned
    /// [`RetryDecision::AskRetry`]. Return `true` to retry with the default
    /// backoff/jitter delay.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &OrchError) -> bool + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> RetryDecision + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &OrchError) -> RetryDecision + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Optional read-only progress callback invoked alongside (not instead
    /// of) the sink for each chunk received.
    pub fn on_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_write = Some(Arc::new(f));
        self
    }

    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Finalize the request. If a `json_body` root was set and `body` was
    /// not already set directly, stringifies it into `body` and sets
    /// `Content-Type: application/json` unless already present
    /// (spec.md §4.C `json_commit`). If no method was explicitly chosen,
    /// defaults to `POST` when a body is present, else `GET`
    /// (spec.md §3).
    pub fn build(mut self) -> Request {
        if let Some(root) = self.json_root.take() {
            if self.body.is_none() {
                self.body = Some(serde_json::to_vec(&root).unwrap_or_default());
                let has_content_type =
                    self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-type"));
                if !has_content_type {
                    self.headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
            }
        }
        if !self.method_explicit && self.body.is_some() {
            self.method = Method::Post;
        }
        Request {
            id: next_request_id(),
            url: self.url,
            method: self.method,
            headers: self.headers,
            body: self.body,
            rate_key: self.rate_key,
            rate_limit_high_priority: self.rate_limit_high_priority,
            priority: self.priority,
            depends_on: self.depends_on,
            connect_timeout: self.connect_timeout,
            transfer_timeout: self.transfer_timeout,
            max_download_size: self.max_download_size,
            low_speed_limit: self.low_speed_limit,
            low_speed_time: self.low_speed_time,
            http_version: self.http_version,
            max_retries: self.max_retries,
            unbounded_retries: self.unbounded_retries,
            backoff: self.backoff,
            jitter: self.jitter,
            min_backoff_delay: self.min_backoff_delay,
            max_backoff_delay: self.max_backoff_delay,
            refresh: self.refresh,
            on_prepare: self.on_prepare,
            on_retry: self.on_retry,
            on_complete: self.on_complete,
            on_failure: self.on_failure,
            on_write: self.on_write,
            sink: Arc::new(AsyncMutex::new(self.sink)),
            attempt: 0,
            bytes_downloaded: 0,
            last_error: None,
            last_http_status: None,
        }
    }
}
