//! Unified error handling for rctmon
//!
//! Module-local failures (frame decoding, transport, reconnect) keep their own
//! `thiserror` enums; everything that crosses a crate or task boundary is
//! converted into [`RctmonError`].

use thiserror::Error;

// ============================================================================
// RctmonError - Main error type
// ============================================================================

/// Main error type for the collector
#[derive(Debug, Error)]
pub enum RctmonError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] figment::Error),

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // Sink Errors
    // ======================================
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("External service error: {service}: {message}")]
    ExternalService { service: String, message: String },

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    // ======================================
    // Catch-all for other errors
    // ======================================
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using RctmonError
pub type RctmonResult<T> = Result<T, RctmonError>;

impl RctmonError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        RctmonErrorTrait::is_retryable(self)
    }
}

impl From<serde_yaml::Error> for RctmonError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[macro_export]
macro_rules! invalid_config {
    ($field:expr, $reason:expr) => {
        $crate::RctmonError::InvalidConfig {
            field: $field.to_string(),
            reason: $reason.to_string(),
        }
    };
}

// ============================================================================
// RctmonError implements RctmonErrorTrait
// ============================================================================

impl RctmonErrorTrait for RctmonError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::ConfigLoad(_) => "CONFIG_LOAD_ERROR",

            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",

            Self::Metrics(_) => "METRICS_ERROR",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",

            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",

            Self::StartupFailed(_) => "STARTUP_FAILED",

            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig { .. } | Self::ConfigLoad(_) => ErrorCategory::Configuration,

            Self::Protocol { .. } => ErrorCategory::Protocol,

            Self::ConnectionFailed { .. } => ErrorCategory::Connection,

            Self::Communication(_) | Self::HttpClient(_) | Self::ExternalService { .. } => {
                ErrorCategory::Network
            },

            Self::Timeout(_) => ErrorCategory::Timeout,

            Self::Metrics(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::StartupFailed(_) => ErrorCategory::Internal,

            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

// ============================================================================
// Error capability trait
// ============================================================================

/// Error category enum - used for classification and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Timeout,

    // Device link
    Protocol,
    Connection,

    Internal,
    Unknown,
}

/// Common interface for rctmon error types
///
/// Sinks use the code as a structured log field and the retry flag to pick a
/// log level for failures they swallow.
pub trait RctmonErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::Protocol
        )
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(RctmonError::Timeout("inverter".into()).is_retryable());
        assert!(RctmonError::ConnectionFailed {
            endpoint: "localhost:8899".into(),
            reason: "refused".into()
        }
        .is_retryable());
        assert!(RctmonError::ExternalService {
            service: "influxdb".into(),
            message: "503 Service Unavailable".into()
        }
        .is_retryable());
        assert!(!RctmonError::StartupFailed("bind".into()).is_retryable());
    }

    #[test]
    fn test_error_codes_and_categories() {
        let err = invalid_config!("device.port", "must not be zero");
        assert_eq!(err.error_code(), "INVALID_CONFIG");
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid configuration: device.port: must not be zero");
    }

    #[test]
    fn test_from_io_error() {
        let err: RctmonError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.error_code(), "IO_ERROR");
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(err.to_string().contains("boom"));
    }
}
