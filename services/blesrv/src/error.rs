//! Error handling for the BLE polling service
//!
//! [`SessionFailure`] is the outcome taxonomy of a single connection session.
//! [`BleSrvError`] covers everything above the session: configuration,
//! device registry, write validation and the coordinator itself.

use std::time::Duration;

use ble_modbus::{CodecError, ShuntError, WriteValidationError};
use errors::{ErrorCategory, ServiceError, ServiceErrorTrait};
use thiserror::Error;

use crate::transport::TransportError;

/// Why a session ended without a result
///
/// Every variant is transient: the device is simply tried again on its next
/// scheduled poll.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    #[error("Connect failed after {attempts} attempt(s)")]
    ConnectTimeout { attempts: u32 },

    #[error("No notification within {0:?}")]
    NotificationTimeout(Duration),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(
        "Write not confirmed: sent {register:#06X}={sent}, echo {echoed_register:#06X}={echoed}"
    )]
    WriteVerificationFailed {
        register: u16,
        sent: u16,
        echoed_register: u16,
        echoed: u16,
    },

    #[error(transparent)]
    Shunt(#[from] ShuntError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Adapter admission failed: {0}")]
    Admission(String),

    #[error("Unsupported request: {0}")]
    Unsupported(&'static str),

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionFailure {
    /// Short stable label for logs and sink reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::NotificationTimeout(_) => "notification_timeout",
            Self::Codec(CodecError::Truncated { .. }) => "truncated",
            Self::Codec(CodecError::CrcMismatch { .. }) => "crc_mismatch",
            Self::Codec(CodecError::ExceptionResponse { .. }) => "exception_response",
            Self::Codec(CodecError::AddressMismatch { .. }) => "address_mismatch",
            Self::Codec(_) => "codec",
            Self::WriteVerificationFailed { .. } => "write_verification_failed",
            Self::Shunt(_) => "shunt_packet",
            Self::Transport(_) => "transport",
            Self::Admission(_) => "admission",
            Self::Unsupported(_) => "unsupported",
            Self::Cancelled => "cancelled",
        }
    }
}

/// BLE Service Error Type
#[derive(Error, Debug)]
pub enum BleSrvError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown device model: {0}")]
    UnknownModel(String),

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already registered: {0}")]
    DuplicateDevice(String),

    #[error("Write rejected: {0}")]
    WriteRejected(#[from] WriteValidationError),

    #[error("Session failed: {0}")]
    Session(#[from] SessionFailure),

    #[error("Coordinator is not running")]
    CoordinatorClosed,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// Result type for the service
pub type Result<T> = std::result::Result<T, BleSrvError>;

impl From<ServiceError> for BleSrvError {
    fn from(err: ServiceError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<BleSrvError> for ServiceError {
    fn from(err: BleSrvError) -> Self {
        match err {
            BleSrvError::ConfigError(msg) => ServiceError::Configuration(msg),
            BleSrvError::UnknownModel(model) => ServiceError::InvalidConfig {
                field: "model".to_string(),
                reason: format!("unknown model '{}'", model),
            },
            BleSrvError::UnknownAdapter(adapter) => ServiceError::InvalidConfig {
                field: "adapter".to_string(),
                reason: format!("unknown adapter '{}'", adapter),
            },
            BleSrvError::DeviceNotFound(address) => ServiceError::NotFound {
                resource: format!("device {}", address),
            },
            BleSrvError::DuplicateDevice(address) => {
                ServiceError::Validation(format!("duplicate device {}", address))
            },
            BleSrvError::WriteRejected(e) => ServiceError::Validation(e.to_string()),
            BleSrvError::Session(e) => ServiceError::Protocol {
                protocol: "modbus-ble".to_string(),
                message: e.to_string(),
            },
            BleSrvError::CoordinatorClosed => {
                ServiceError::ShutdownError("coordinator stopped".to_string())
            },
            BleSrvError::TransportUnavailable(msg) => ServiceError::StartupFailed(msg),
        }
    }
}

impl ServiceErrorTrait for BleSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "BLESRV_CONFIG_ERROR",
            Self::UnknownModel(_) => "BLESRV_UNKNOWN_MODEL",
            Self::UnknownAdapter(_) => "BLESRV_UNKNOWN_ADAPTER",
            Self::DeviceNotFound(_) => "BLESRV_DEVICE_NOT_FOUND",
            Self::DuplicateDevice(_) => "BLESRV_DUPLICATE_DEVICE",
            Self::WriteRejected(_) => "BLESRV_WRITE_REJECTED",
            Self::Session(_) => "BLESRV_SESSION_FAILED",
            Self::CoordinatorClosed => "BLESRV_COORDINATOR_CLOSED",
            Self::TransportUnavailable(_) => "BLESRV_TRANSPORT_UNAVAILABLE",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError(_) | Self::UnknownModel(_) | Self::UnknownAdapter(_) => {
                ErrorCategory::Configuration
            },
            Self::DeviceNotFound(_) => ErrorCategory::NotFound,
            Self::DuplicateDevice(_) | Self::WriteRejected(_) => ErrorCategory::Validation,
            Self::Session(SessionFailure::ConnectTimeout { .. }) => ErrorCategory::Connection,
            Self::Session(SessionFailure::NotificationTimeout(_)) => ErrorCategory::Timeout,
            Self::Session(SessionFailure::Codec(CodecError::CrcMismatch { .. })) => {
                ErrorCategory::DataCorruption
            },
            Self::Session(_) => ErrorCategory::Protocol,
            Self::CoordinatorClosed => ErrorCategory::Internal,
            Self::TransportUnavailable(_) => ErrorCategory::Network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_failure_kinds() {
        assert_eq!(
            SessionFailure::from(CodecError::CrcMismatch {
                expected: 1,
                actual: 2
            })
            .kind(),
            "crc_mismatch"
        );
        assert_eq!(
            SessionFailure::ConnectTimeout { attempts: 3 }.kind(),
            "connect_timeout"
        );
        assert_eq!(SessionFailure::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_categories() {
        let err = BleSrvError::Session(SessionFailure::NotificationTimeout(
            Duration::from_secs(8),
        ));
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(err.is_retryable());

        let err = BleSrvError::UnknownModel("inverter".into());
        assert_eq!(err.error_code(), "BLESRV_UNKNOWN_MODEL");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_into_service_error() {
        let err: ServiceError = BleSrvError::DeviceNotFound("AA:BB".into()).into();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err: ServiceError = BleSrvError::UnknownAdapter("hci7".into()).into();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
