// Detection error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Detection error code constants
///
/// Error code range: 2001-2003
pub struct DetectionErrorCodes {}

impl DetectionErrorCodes {
    /// Waveform summary is malformed (bad bucket duration, mismatched buckets)
    pub const INVALID_WAVEFORM: i32 = 2001;

    /// Detection options are out of range
    pub const INVALID_OPTIONS: i32 = 2002;

    /// Detection was cancelled at a checkpoint
    pub const CANCELLED: i32 = 2003;
}

/// Log a detection error with structured context
pub fn log_detection_error(err: &DetectionError, context: &str) {
    error!(
        "Detection error in {}: code={}, component=OnsetAnalyzer, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Errors raised by the onset/tempo/quantization engine
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionError {
    /// Waveform summary cannot be analysed
    InvalidWaveform { reason: String },

    /// Detection options are invalid
    InvalidOptions { reason: String },

    /// Cancellation observed inside a detection loop
    Cancelled,
}

impl ErrorCode for DetectionError {
    fn code(&self) -> i32 {
        match self {
            DetectionError::InvalidWaveform { .. } => DetectionErrorCodes::INVALID_WAVEFORM,
            DetectionError::InvalidOptions { .. } => DetectionErrorCodes::INVALID_OPTIONS,
            DetectionError::Cancelled => DetectionErrorCodes::CANCELLED,
        }
    }

    fn message(&self) -> String {
        match self {
            DetectionError::InvalidWaveform { reason } => format!("Invalid waveform: {}", reason),
            DetectionError::InvalidOptions { reason } => {
                format!("Invalid detection options: {}", reason)
            }
            DetectionError::Cancelled => "Detection cancelled".to_string(),
        }
    }
}

impl fmt::Display for DetectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DetectionError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for DetectionError {}
