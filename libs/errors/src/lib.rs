//! Unified error handling for the voltage-plc workspace
//!
//! Every crate in the workspace reports failures through [`PlcError`]. Per-tag
//! failures of a multi-tag request are NOT errors: they travel as response codes
//! inside a successful response. A `PlcError` is reserved for systemic failures
//! (no connection, request could not be submitted, join interrupted).

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// PlcError - Main error type
// ============================================================================

/// Main error type for the request lifecycle core
#[derive(Debug, Error)]
pub enum PlcError {
    // ======================================
    // Connection Errors
    // ======================================
    #[error("Connection failed: {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Connection {key} is already borrowed")]
    BorrowConflict { key: String },

    #[error("Timeout acquiring lease for connection {key} after {waited_ms}ms")]
    BorrowTimeout { key: String, waited_ms: u64 },

    #[error("Lease is no longer valid: {0}")]
    LeaseInvalidated(String),

    #[error("Connection cache for {key} is closed")]
    CacheClosed { key: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Connection broken: {0}")]
    ConnectionBroken(String),

    // ======================================
    // Transaction Errors
    // ======================================
    #[error("Transaction {id} was already ended")]
    TransactionAlreadyEnded { id: u64 },

    #[error("Transaction queue full (depth {depth})")]
    QueueFull { depth: usize },

    #[error("Transaction manager is shut down")]
    TransactionManagerShutdown,

    // ======================================
    // Orchestration Errors
    // ======================================
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    // ======================================
    // Request Construction Errors
    // ======================================
    #[error("Duplicate tag name: {0}")]
    DuplicateTag(String),

    #[error("Invalid tag address: {address}: {reason}")]
    InvalidTagAddress { address: String, reason: String },

    #[error("Tag not found: {0}")]
    TagNotFound(String),

    #[error("Data type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // ======================================
    // Wire & Driver Errors
    // ======================================
    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using PlcError
pub type PlcResult<T> = Result<T, PlcError>;

/// Error category enum - used for classification and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Obtaining, leasing or keeping a connection
    Connection,
    /// Admission control on a single connection
    Transaction,
    /// Malformed or unsupported request
    Request,
    /// The device or the wire failed
    Remote,
    /// Programming or runtime failures inside the core
    Internal,
}

impl PlcError {
    /// Get error category (for classification/metrics)
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionFailed { .. }
            | Self::BorrowConflict { .. }
            | Self::BorrowTimeout { .. }
            | Self::LeaseInvalidated(_)
            | Self::CacheClosed { .. }
            | Self::NotConnected(_)
            | Self::ConnectionBroken(_) => ErrorCategory::Connection,

            Self::TransactionAlreadyEnded { .. }
            | Self::QueueFull { .. }
            | Self::TransactionManagerShutdown => ErrorCategory::Transaction,

            Self::DuplicateTag(_)
            | Self::InvalidTagAddress { .. }
            | Self::TagNotFound(_)
            | Self::TypeMismatch { .. }
            | Self::Unsupported(_) => ErrorCategory::Request,

            Self::Timeout(_) | Self::Protocol { .. } | Self::Io(_) => ErrorCategory::Remote,

            Self::Cancelled(_)
            | Self::Configuration(_)
            | Self::Internal(_)
            | Self::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Get error code (for logs and monitoring)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::BorrowConflict { .. } => "BORROW_CONFLICT",
            Self::BorrowTimeout { .. } => "BORROW_TIMEOUT",
            Self::LeaseInvalidated(_) => "LEASE_INVALIDATED",
            Self::CacheClosed { .. } => "CACHE_CLOSED",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::ConnectionBroken(_) => "CONNECTION_BROKEN",
            Self::TransactionAlreadyEnded { .. } => "TRANSACTION_ALREADY_ENDED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::TransactionManagerShutdown => "TRANSACTION_MANAGER_SHUTDOWN",
            Self::Cancelled(_) => "CANCELLED",
            Self::DuplicateTag(_) => "DUPLICATE_TAG",
            Self::InvalidTagAddress { .. } => "INVALID_TAG_ADDRESS",
            Self::TagNotFound(_) => "TAG_NOT_FOUND",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    /// Check if this error is retryable
    ///
    /// Retry policy belongs to the caller; the core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BorrowConflict { .. }
                | Self::BorrowTimeout { .. }
                | Self::QueueFull { .. }
                | Self::Timeout(_)
                | Self::ConnectionBroken(_)
                | Self::ConnectionFailed { .. }
                | Self::Cancelled(_)
        )
    }

    /// Whether observing this error means the underlying connection can no longer be trusted
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Io(_)
                | Self::Protocol { .. }
                | Self::ConnectionBroken(_)
                | Self::NotConnected(_)
        )
    }

    /// Shorthand for a protocol error
    pub fn protocol(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            message: message.into(),
        }
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::PlcError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PlcError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($protocol:expr, $msg:expr) => {
        $crate::PlcError::Protocol {
            protocol: $protocol.to_string(),
            message: $msg.to_string(),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_categorized() {
        let err = PlcError::BorrowConflict {
            key: "s7://10.0.0.1".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert_eq!(err.error_code(), "BORROW_CONFLICT");
        assert!(err.is_retryable());
        assert!(!err.breaks_connection());
    }

    #[test]
    fn test_wire_errors_break_connection() {
        assert!(PlcError::Timeout("plc".into()).breaks_connection());
        assert!(protocol_error!("s7", "bad tpkt").breaks_connection());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(PlcError::from(io).breaks_connection());
        assert!(!PlcError::Unsupported("browse".into()).breaks_connection());
    }

    #[test]
    fn test_transaction_misuse_is_not_retryable() {
        let err = PlcError::TransactionAlreadyEnded { id: 7 };
        assert_eq!(err.category(), ErrorCategory::Transaction);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Transaction 7 was already ended");
    }

    #[test]
    fn test_config_error_macro() {
        let err = config_error!("max_concurrent_requests must be > {}", 0);
        assert_eq!(
            err.to_string(),
            "Configuration error: max_concurrent_requests must be > 0"
        );
    }

    #[test]
    fn test_anyhow_passthrough() {
        let err: PlcError = anyhow::anyhow!("driver specific").into();
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert_eq!(err.to_string(), "driver specific");
    }
}
