//! Error taxonomy for the pipeline.
//!
//! Variants map onto the recovery rules each stage applies:
//!
//! * retryable (network, server-side, rate limiting) — handed to
//!   [`crate::ratelimit::retry`] with a backoff derived from the class;
//! * per-record (`Record`) — logged, the single record skipped, batch continues;
//! * persistence (`Storage`) — current transaction rolls back, watermark
//!   untouched, run continues with the next unit of work;
//! * fatal (`WatermarkReadback`, `Config`, `Schema`) — abort the whole run
//!   before any further work.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream rate limited (status {status})")]
    RateLimited { status: u16 },

    #[error("upstream forbade the request (status {status})")]
    Forbidden { status: u16 },

    #[error("upstream resource not found")]
    NotFound,

    #[error("upstream server error (status {status})")]
    Server { status: u16 },

    #[error("embedding provider error: {0}")]
    Provider(String),

    #[error("record {notice_id} skipped: {message}")]
    Record { notice_id: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("watermark read-back mismatch for stage {stage}: wrote {wrote}, read {read}")]
    WatermarkReadback {
        stage: &'static str,
        wrote: String,
        read: String,
    },

    #[error("watermark for stage {stage} would regress: stored {stored}, requested {requested}")]
    WatermarkRegression {
        stage: &'static str,
        stored: String,
        requested: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage schema error: {0}")]
    Schema(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Errors that abort the entire run before doing any further work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::WatermarkReadback { .. }
                | PipelineError::Config(_)
                | PipelineError::Schema(_)
        )
    }

    /// Errors worth another attempt under a [`crate::ratelimit::RetryPolicy`].
    ///
    /// Rate-limit and forbidden responses are retryable but back off more
    /// aggressively; the distinction lives in [`Self::is_throttle`].
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PipelineError::RateLimited { .. }
            | PipelineError::Forbidden { .. }
            | PipelineError::Server { .. } => true,
            _ => false,
        }
    }

    /// True for responses that feed the adaptive controller's error ratio.
    pub fn is_throttle(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited { .. } | PipelineError::Forbidden { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_errors_are_retryable() {
        let e = PipelineError::RateLimited { status: 429 };
        assert!(e.is_retryable());
        assert!(e.is_throttle());
        assert!(!e.is_fatal());
    }

    #[test]
    fn watermark_mismatch_is_fatal() {
        let e = PipelineError::WatermarkReadback {
            stage: "fetch",
            wrote: "2025-01-01".into(),
            read: "2024-12-31".into(),
        };
        assert!(e.is_fatal());
        assert!(!e.is_retryable());
    }

    #[test]
    fn record_errors_are_neither_fatal_nor_retryable() {
        let e = PipelineError::Record {
            notice_id: "n-1".into(),
            message: "unparseable publication date".into(),
        };
        assert!(!e.is_fatal());
        assert!(!e.is_retryable());
    }
}
