use thiserror::Error;

use crate::types::ServiceKind;

/// Result type for pipeline operations.
///
/// These errors circulate internally only: the caller-facing surface
/// (`CrowdAnalyzer::resolve`) absorbs every failure into a fallback-sourced
/// result and never returns an error.
pub type Result<T> = std::result::Result<T, MitigationError>;

/// Errors that can occur inside the mitigation pipeline.
#[derive(Debug, Error)]
pub enum MitigationError {
    /// HTTP transport failure (connect error, timeout, invalid URL)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream signalled a rate limit (HTTP 429)
    #[error("{service} upstream rate limited (status {status})")]
    RateLimited { service: ServiceKind, status: u16 },

    /// Upstream returned a non-2xx status
    #[error("{service} upstream failure (status {status}): {body}")]
    UpstreamStatus {
        service: ServiceKind,
        status: u16,
        body: String,
    },

    /// Upstream response body did not have the expected structure
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    /// A combined batch response could not be split back into segments
    #[error("batch response could not be demultiplexed: {0}")]
    BatchParse(String),

    /// Every key in the service's pool is blacklisted or over quota
    #[error("no usable key for {0}")]
    NoKeyAvailable(ServiceKind),

    /// The circuit breaker is open for this service
    #[error("circuit open for {0}")]
    CircuitOpen(ServiceKind),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MitigationError {
    /// True when this failure is an explicit upstream rate-limit signal.
    ///
    /// Rate limits get extra treatment beyond the circuit breaker: the key
    /// that hit the limit is blacklisted for the configured duration.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, MitigationError::RateLimited { .. })
    }
}
