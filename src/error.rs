//! Crate-wide error taxonomy.
//!
//! Every way a request can terminate unsuccessfully collapses into one of
//! these variants, surfaced to `on_failure`/`Sink::failure` callbacks.

use std::time::Duration;

/// Unified error type for the orchestrator.
#[derive(Debug, thiserror::Error, Clone)]
pub enum OrchError {
    /// The transport driver reported a non-OK result code (connect failure,
    /// DNS failure, TLS failure, ...). Carries no HTTP status.
    #[error("transport error (code {code}): {message}")]
    Transport {
        /// Opaque transport result code (driver-specific).
        code: i32,
        /// Human-readable detail from the transport driver.
        message: String,
    },

    /// The transport succeeded but the HTTP status was not 200.
    #[error("http error: status {status}")]
    Http {
        /// The HTTP status code returned.
        status: u16,
    },

    /// A dependency this request was blocked on was published with an
    /// absent payload.
    #[error("dependency failed (aborted by callback)")]
    DependencyFailed,

    /// Response body exceeded `max_download_size` during streaming.
    #[error("response exceeded max_download_size ({limit} bytes, content-length {content_length:?})")]
    SizeExceeded {
        /// The configured cap.
        limit: u64,
        /// `Content-Length` header value, if the server sent one.
        content_length: Option<u64>,
    },

    /// `on_prepare` returned `false`; the request is destroyed without a
    /// completion callback.
    #[error("on_prepare refused the request")]
    PrepareRefused,

    /// The request was cancelled before or during its attempt.
    #[error("request cancelled")]
    Cancelled,

    /// The request could not even be submitted (missing URL, double
    /// submission, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The per-transfer timeout elapsed.
    #[error("transfer timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout {
        /// Wall time actually elapsed before the timeout fired.
        elapsed: Duration,
        /// The configured timeout.
        timeout: Duration,
    },
}

impl OrchError {
    /// HTTP status code, if this error carries one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            OrchError::Http { status } => Some(*status),
            _ => None,
        }
    }

    /// Transport result code, if this error originated at the transport layer.
    pub fn transport_code(&self) -> Option<i32> {
        match self {
            OrchError::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_dependency_failed(&self) -> bool {
        matches!(self, OrchError::DependencyFailed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrchError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchError::Timeout { .. })
    }

    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, OrchError::SizeExceeded { .. })
    }

    pub fn is_prepare_refused(&self) -> bool {
        matches!(self, OrchError::PrepareRefused)
    }
}
