//! Streaming response sink.
//!
//! Shaped after `telemetry::sinks::TelemetrySink`'s init/emit/shutdown
//! lifecycle, but widened from "accept one event" to "accept a byte
//! stream": `init` fires once per attempt (including retries), `write` is
//! called for each chunk as it arrives, and exactly one of `complete`/
//! `failure` fires once the request reaches a terminal outcome (not per
//! attempt — a request that fails twice then succeeds only ever sees one
//! `complete` call).

use async_trait::async_trait;

use crate::error::OrchError;

/// Destination for a request's response body.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Called once at the start of every attempt (initial and retries).
    /// Implementations that accumulate per-attempt state should reset it
    /// here.
    async fn init(&mut self) {}

    /// Called for each chunk of the response body, in order, for the
    /// current attempt. Returns the number of bytes accepted; returning
    /// fewer than `chunk.len()` aborts the transfer with
    /// [`OrchError::SizeExceeded`].
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        Ok(chunk.len())
    }

    /// Called exactly once, when the request reaches terminal success.
    async fn complete(&mut self) {}

    /// Called exactly once, when the request reaches terminal failure
    /// (retries exhausted, non-retryable error, dependency failure, or
    /// size limit exceeded). Never called for requests refused by
    /// `on_prepare` or cancelled before any attempt started.
    async fn failure(&mut self, error: &OrchError) {
        let _ = error;
    }

    /// Called once the request is fully destroyed, regardless of outcome,
    /// for releasing resources the sink itself holds open (file handles,
    /// buffers).
    async fn destroy(&mut self) {}
}

/// A sink that discards everything. Useful for fire-and-forget requests
/// (webhooks, pings) where only the completion callback matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {}

/// A sink that buffers the whole response body in memory. Convenient for
/// small JSON/text responses and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated body bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take ownership of the accumulated body, leaving the sink empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn init(&mut self) {
        self.buf.clear();
    }

    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(chunk);
        Ok(chunk.len())
    }
}
