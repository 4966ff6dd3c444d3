//! Unified error handling for the BLE polling services
//!
//! Every service keeps its own domain error type and exposes a common surface
//! through [`ServiceErrorTrait`]. Errors that reach a binary boundary are
//! collapsed into [`ServiceError`].

use thiserror::Error;

// ============================================================================
// ServiceError - binary boundary error
// ============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    // Configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // Device communication
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    // Requests
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    // Runtime
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Process exit code when this error terminates a binary
    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Validation => 2,
            ErrorCategory::NotFound => 3,
            ErrorCategory::Network | ErrorCategory::Connection | ErrorCategory::Timeout => 4,
            _ => 1,
        }
    }
}

impl From<serde_yaml::Error> for ServiceError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

impl From<figment::Error> for ServiceError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl ServiceErrorTrait for ServiceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::MissingConfig(_) => "MISSING_CONFIG",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Io(_) => "IO_ERROR",
            Self::Deserialization(_) => "DESERIALIZATION_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::ShutdownError(_) => "SHUTDOWN_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::MissingConfig(_) => {
                ErrorCategory::Configuration
            },
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::StartupFailed(_) => ErrorCategory::Network,
            Self::Io(_)
            | Self::Deserialization(_)
            | Self::ShutdownError(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

// ============================================================================
// Service Error Trait
// ============================================================================

/// Error category, used for classification and log routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure
    Configuration,
    Network,
    Timeout,

    // Requests
    Validation,
    NotFound,

    // Device link
    Protocol,
    Connection,

    // System
    Internal,
    DataCorruption,
}

/// Common error capability trait
///
/// Service crates keep their domain error enums (e.g. the BLE service's
/// `BleSrvError`) and gain a uniform interface by implementing this trait.
pub trait ServiceErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable code for logs
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    /// Whether trying again later may succeed
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::Protocol
                | ErrorCategory::DataCorruption
        )
    }

    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal => Level::ERROR,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = ServiceError::Protocol {
            protocol: "modbus-ble".into(),
            message: "crc mismatch".into(),
        };
        assert!(err.is_retryable());
        assert!(!ServiceError::Validation("bad".into()).is_retryable());
        assert!(!ServiceError::NotFound {
            resource: "adapter hci9".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_codes_and_categories() {
        let err = ServiceError::InvalidConfig {
            field: "devices[0].model".into(),
            reason: "unknown model".into(),
        };
        assert_eq!(err.error_code(), "INVALID_CONFIG");
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.log_level(), tracing::Level::WARN);

        let err = ServiceError::Internal("join failed".into());
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_from_yaml_error() {
        let parse: Result<u32, _> = serde_yaml::from_str("not: [a number");
        let err: ServiceError = parse.unwrap_err().into();
        assert_eq!(err.error_code(), "DESERIALIZATION_ERROR");
    }
}
