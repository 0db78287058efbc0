//! Convenient re-exports for common `reqorch` types.
pub use crate::{
    Backoff, Clock, HttpVersion, Jitter, Loop, LoopHandle, Method, MonotonicClock, NullSink,
    OrchError, Priority, Registry, RegistryHandle, Request, RequestBuilder, RequestId,
    RetryDecision, Sink, Transport,
};
