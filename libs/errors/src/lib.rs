//! Unified error handling for the fieldlink acquisition engine
//!
//! Every crate in the workspace reports failures through [`CollectError`].
//! Poll-cycle errors are cloned into aggregate results and broadcast to
//! subscribers, so the enum carries owned strings instead of source errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ErrorInfo - serialisable error summary
// ============================================================================

/// Serialisable error summary attached to published cycle results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code, e.g. `RETRIES_EXHAUSTED`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Optional detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ============================================================================
// CollectError - main error type
// ============================================================================

/// Main error type for device acquisition
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollectError {
    // ======================================
    // Lifecycle / readiness
    // ======================================
    #[error("Unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    #[error("Unable to connect to device: {0}")]
    ConnectFailure(String),

    #[error("Device has no variables to collect")]
    EmptyVariableSet,

    // ======================================
    // Transport
    // ======================================
    #[error("Bad connection: {0}")]
    BadConnection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),

    // ======================================
    // Response validation
    // ======================================
    #[error("Transaction id mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    #[error("Slave id mismatch: expected {expected}, got {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },

    #[error(
        "Device reported error for FC{function_code:02X}: {} (code {exception_code:02X})",
        exception_description(*.exception_code)
    )]
    DeviceReportedFunctionError {
        function_code: u8,
        exception_code: u8,
    },

    #[error("Insufficient response length: expected {expected} bytes, got {actual}")]
    InsufficientResponseLength { expected: usize, actual: usize },

    #[error("Checksum error: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumError { expected: u16, actual: u16 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request failed after {0} attempts")]
    RetriesExhausted(u32),

    // ======================================
    // Configuration
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Registry & actions
    // ======================================
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already registered: {0}")]
    DeviceExists(String),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Duplicate action for variable: {0}")]
    DuplicateAction(String),

    #[error("Variable is read-only: {0}")]
    ReadOnlyVariable(String),

    #[error("Device is not connected: {0}")]
    DeviceNotConnected(String),

    #[error("No legal action to deliver")]
    NoLegalAction,

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Unsupported write: {0}")]
    UnsupportedWrite(String),

    #[error("Unsupported control event: {0}")]
    UnsupportedControl(String),

    // ======================================
    // Runtime
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{} errors: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<CollectError>),
}

/// Result type alias using CollectError
pub type CollectResult<T> = Result<T, CollectError>;

/// Standard Modbus exception code description
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

fn join_messages(errors: &[CollectError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error category - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Validation,
    NotFound,
    Conflict,
    Timeout,
    Internal,
}

impl CollectError {
    // Helper constructors

    pub fn bad_connection(msg: impl Into<String>) -> Self {
        Self::BadConnection(msg.into())
    }

    pub fn connect_failure(msg: impl Into<String>) -> Self {
        Self::ConnectFailure(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_value(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Collapse a list of errors: none → `Ok`, one → that error, many → `Multiple`
    pub fn from_many(mut errors: Vec<CollectError>) -> CollectResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Transport-level failure: the messenger must be closed and replaced
    pub fn is_bad_connection(&self) -> bool {
        matches!(
            self,
            Self::BadConnection(_) | Self::Timeout(_) | Self::Io(_) | Self::ConnectFailure(_)
        )
    }

    /// Response failed validation; retry on the same messenger
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TransactionMismatch { .. }
                | Self::SlaveMismatch { .. }
                | Self::DeviceReportedFunctionError { .. }
                | Self::InsufficientResponseLength { .. }
                | Self::ChecksumError { .. }
                | Self::Protocol(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.is_bad_connection() || self.is_validation()
    }

    /// Stable error code (for logs and published results)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedDeviceType(_) => "UNSUPPORTED_DEVICE_TYPE",
            Self::ConnectFailure(_) => "CONNECT_FAILURE",
            Self::EmptyVariableSet => "EMPTY_VARIABLE_SET",
            Self::BadConnection(_) => "BAD_CONNECTION",
            Self::Timeout(_) => "TIMEOUT",
            Self::Io(_) => "IO_ERROR",
            Self::TransactionMismatch { .. } => "TRANSACTION_MISMATCH",
            Self::SlaveMismatch { .. } => "SLAVE_MISMATCH",
            Self::DeviceReportedFunctionError { .. } => "DEVICE_REPORTED_FUNCTION_ERROR",
            Self::InsufficientResponseLength { .. } => "INSUFFICIENT_RESPONSE_LENGTH",
            Self::ChecksumError { .. } => "CHECKSUM_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::RetriesExhausted(_) => "RETRIES_EXHAUSTED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::DeviceExists(_) => "DEVICE_EXISTS",
            Self::VariableNotFound(_) => "VARIABLE_NOT_FOUND",
            Self::DuplicateAction(_) => "DUPLICATE_ACTION",
            Self::ReadOnlyVariable(_) => "READ_ONLY_VARIABLE",
            Self::DeviceNotConnected(_) => "DEVICE_NOT_CONNECTED",
            Self::NoLegalAction => "NO_LEGAL_ACTION",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::UnsupportedWrite(_) => "UNSUPPORTED_WRITE",
            Self::UnsupportedControl(_) => "UNSUPPORTED_CONTROL",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Multiple(_) => "MULTIPLE_ERRORS",
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_)
            | Self::InvalidConfig { .. }
            | Self::Serialization(_)
            | Self::UnsupportedDeviceType(_)
            | Self::EmptyVariableSet => ErrorCategory::Configuration,

            Self::ConnectFailure(_)
            | Self::BadConnection(_)
            | Self::Io(_)
            | Self::DeviceNotConnected(_)
            | Self::RetriesExhausted(_) => ErrorCategory::Connection,

            Self::Timeout(_) => ErrorCategory::Timeout,

            Self::TransactionMismatch { .. }
            | Self::SlaveMismatch { .. }
            | Self::DeviceReportedFunctionError { .. }
            | Self::InsufficientResponseLength { .. }
            | Self::ChecksumError { .. }
            | Self::Protocol(_)
            | Self::ReadOnlyVariable(_)
            | Self::NoLegalAction
            | Self::InvalidValue { .. }
            | Self::UnsupportedWrite(_)
            | Self::UnsupportedControl(_) => ErrorCategory::Validation,

            Self::DeviceNotFound(_) | Self::VariableNotFound(_) => ErrorCategory::NotFound,

            Self::DeviceExists(_) | Self::DuplicateAction(_) => ErrorCategory::Conflict,

            Self::Internal(_) | Self::Multiple(_) => ErrorCategory::Internal,
        }
    }

    /// Get log level
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal => Level::ERROR,
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::Validation => {
                Level::WARN
            },
            ErrorCategory::NotFound | ErrorCategory::Conflict => Level::INFO,
            ErrorCategory::Configuration => Level::WARN,
        }
    }

    /// Convert to a serialisable summary
    pub fn to_error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.error_code(), self.to_string());
        match self {
            Self::Multiple(errors) => info.with_details(
                errors
                    .iter()
                    .map(CollectError::error_code)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => info,
        }
    }
}

// Conversion traits for common error types
impl From<std::io::Error> for CollectError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CollectError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CollectError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for CollectError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::CollectError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CollectError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::CollectError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CollectError::Protocol(format!($fmt, $($arg)*))
    };
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_bad_connection_classification() {
        assert!(CollectError::bad_connection("reset").is_bad_connection());
        assert!(CollectError::Timeout("read".into()).is_bad_connection());
        assert!(!CollectError::ChecksumError {
            expected: 1,
            actual: 2
        }
        .is_bad_connection());
    }

    #[test]
    fn test_validation_classification() {
        let errors = [
            CollectError::TransactionMismatch {
                expected: 1,
                actual: 2,
            },
            CollectError::SlaveMismatch {
                expected: 1,
                actual: 3,
            },
            CollectError::DeviceReportedFunctionError {
                function_code: 3,
                exception_code: 2,
            },
            CollectError::InsufficientResponseLength {
                expected: 9,
                actual: 7,
            },
            CollectError::ChecksumError {
                expected: 0x1234,
                actual: 0x4321,
            },
        ];
        for e in &errors {
            assert!(e.is_validation(), "{e} should be a validation error");
            assert!(e.is_retryable());
        }
        assert!(!CollectError::EmptyVariableSet.is_retryable());
    }

    #[test]
    fn test_exception_message() {
        let e = CollectError::DeviceReportedFunctionError {
            function_code: 0x03,
            exception_code: 0x02,
        };
        assert!(e.to_string().contains("Illegal Data Address"));
        assert_eq!(exception_description(0x0B), "Gateway Target Device Failed to Respond");
        assert_eq!(exception_description(0x7F), "Unknown Exception");
    }

    #[test]
    fn test_from_many() {
        assert!(CollectError::from_many(vec![]).is_ok());

        let single = CollectError::from_many(vec![CollectError::NoLegalAction]).unwrap_err();
        assert_eq!(single, CollectError::NoLegalAction);

        let many = CollectError::from_many(vec![
            CollectError::VariableNotFound("a".into()),
            CollectError::ReadOnlyVariable("b".into()),
        ])
        .unwrap_err();
        assert!(matches!(many, CollectError::Multiple(ref v) if v.len() == 2));
        assert!(many.to_string().starts_with("2 errors"));
        assert_eq!(
            many.to_error_info().details.as_deref(),
            Some("VARIABLE_NOT_FOUND,READ_ONLY_VARIABLE")
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(CollectError::from(timeout), CollectError::Timeout(_)));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(CollectError::from(reset).error_code(), "IO_ERROR");
    }

    #[test]
    fn test_macros() {
        let e = config_error!("missing {}", "port");
        assert_eq!(e, CollectError::Configuration("missing port".into()));
        let p = protocol_error!("bad frame");
        assert_eq!(p.category(), ErrorCategory::Validation);
    }
}
