//! Errors raised while resolving a URL against an upstream platform.

/// Transient upstream failure. Counts against the circuit breaker.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether a handler-level retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Status(code) => *code >= 500 || *code == 429,
            Self::Decode(_) => false,
        }
    }
}
