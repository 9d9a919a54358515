// External backend error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Backend error code constants
///
/// Error code range: 3001-3005
pub struct BackendErrorCodes {}

impl BackendErrorCodes {
    /// Backend cannot be used on this machine (missing model, no device)
    pub const UNAVAILABLE: i32 = 3001;

    /// Backend call exceeded its time budget
    pub const TIMEOUT: i32 = 3002;

    /// Backend reported a failure
    pub const FAILED: i32 = 3003;

    /// Backend call observed cancellation
    pub const CANCELLED: i32 = 3004;

    /// File system error while reading or writing audio
    pub const IO: i32 = 3005;
}

/// Log a backend error with structured context
pub fn log_backend_error(err: &BackendError, context: &str) {
    error!(
        "Backend error in {}: code={}, component=Backend, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Errors reported by separation, decoding and draft-building backends
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Backend is not usable
    Unavailable { reason: String },

    /// Operation did not finish in time
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation failed
    Failed { reason: String },

    /// Operation was cancelled
    Cancelled,

    /// I/O failure
    Io { details: String },
}

impl ErrorCode for BackendError {
    fn code(&self) -> i32 {
        match self {
            BackendError::Unavailable { .. } => BackendErrorCodes::UNAVAILABLE,
            BackendError::Timeout { .. } => BackendErrorCodes::TIMEOUT,
            BackendError::Failed { .. } => BackendErrorCodes::FAILED,
            BackendError::Cancelled => BackendErrorCodes::CANCELLED,
            BackendError::Io { .. } => BackendErrorCodes::IO,
        }
    }

    fn message(&self) -> String {
        match self {
            BackendError::Unavailable { reason } => format!("Backend unavailable: {}", reason),
            BackendError::Timeout {
                operation,
                timeout_ms,
            } => format!("{} timed out after {} ms", operation, timeout_ms),
            BackendError::Failed { reason } => format!("Backend failed: {}", reason),
            BackendError::Cancelled => "Backend call cancelled".to_string(),
            BackendError::Io { details } => format!("I/O error: {}", details),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackendError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for BackendError {}

/// Convert from std::io::Error to BackendError
impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io {
            details: err.to_string(),
        }
    }
}
