#![forbid(unsafe_code)]

//! # reqorch
//!
//! An asynchronous HTTP request orchestrator: a scheduler that drives many
//! concurrent outbound requests against per-transfer timeouts, jittered
//! exponential backoff, per-key rate limits with high-priority preemption,
//! a resource dependency graph, and a pluggable response sink.
//!
//! ## Quick start
//!
//! ```rust
//! use reqorch::{Loop, Request, RetryDecision};
//!
//! # async fn run() {
//! let mut orchestrator = Loop::new();
//! orchestrator.submit(
//!     Request::builder("https://example.com/health")
//!         .on_complete(|_req| RetryDecision::Terminal)
//!         .build(),
//! );
//! orchestrator.run().await;
//! # }
//! ```

mod backoff;
mod clock;
mod error;
mod jitter;
mod loop_;
mod rate_manager;
mod request;
mod resources;
mod sink;
mod sleeper;
mod transport;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::OrchError;
pub use jitter::Jitter;
pub use loop_::{Loop, LoopHandle, MetricsSnapshot};
pub use rate_manager::{RateManager, RetryAfter};
pub use request::{
    HttpVersion, Method, Priority, RefreshPolicy, Request, RequestBuilder, RequestId,
    RetryDecision,
};
pub use resources::{CleanupHook, Payload, Registry, RegistryHandle, ResourceId};
pub use sink::{MemorySink, NullSink, Sink};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{ReqwestTransport, TransferOutcome, TransferSpec, Transport};

pub mod prelude;
