use thiserror::Error;

pub type GuardResult<T> = Result<T, GuardError>;

/// Permanent errors: bad configuration or invalid input. Never retried.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid spend amount: {0}")]
    InvalidAmount(f64),

    #[error("Invalid LTV sample for key '{key}': {value}")]
    InvalidSample { key: String, value: f64 },

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for GuardError {
    fn from(e: config::ConfigError) -> Self {
        GuardError::Config(e.to_string())
    }
}

/// Classifies an error as transient (worth retrying) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Short label for per-error-type metrics.
pub trait FailureKind {
    fn kind(&self) -> &'static str;
}

/// Failure of a single remote call (predictor or ad platform API).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("call timed out after {0}ms")]
    Timeout(u64),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("could not decode upstream response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl FailureKind for TransportError {
    fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::ConnectionReset(_) => "connection_reset",
            TransportError::Status(code) if *code >= 500 => "server_error",
            TransportError::Status(_) => "client_error",
            TransportError::Decode(_) => "decode",
            TransportError::Other(_) => "other",
        }
    }
}

impl Retryable for TransportError {
    /// Timeouts, connection resets and 5xx are transient; everything else is permanent.
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::ConnectionReset(_) => true,
            TransportError::Status(code) => (500..600).contains(code),
            TransportError::Decode(_) | TransportError::Other(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_classification() {
        assert!(TransportError::Timeout(100).is_retryable());
        assert!(TransportError::ConnectionReset("peer".into()).is_retryable());
        assert!(TransportError::Status(503).is_retryable());
        assert!(!TransportError::Status(404).is_retryable());
        assert!(!TransportError::Status(429).is_retryable());
        assert!(!TransportError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(TransportError::Status(502).kind(), "server_error");
        assert_eq!(TransportError::Status(400).kind(), "client_error");
        assert_eq!(TransportError::Timeout(5).kind(), "timeout");
    }
}
