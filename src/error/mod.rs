// Error types for the rhythm drafter
//
// This module defines typed errors for detection, external backends and the
// pipeline itself, each carrying a numeric code so callers can react to
// failures without string matching.

mod backend;
mod detection;
mod pipeline;

pub use backend::{log_backend_error, BackendError, BackendErrorCodes};
pub use detection::{log_detection_error, DetectionError, DetectionErrorCodes};
pub use pipeline::{log_pipeline_error, PipelineError, PipelineErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// the library boundary.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
