// Pipeline error types and constants

use crate::error::{BackendError, DetectionError, ErrorCode};
use crate::pipeline::StageId;
use log::error;
use std::fmt;

/// Pipeline error code constants
///
/// Error code range: 1001-1008
pub struct PipelineErrorCodes {}

impl PipelineErrorCodes {
    /// A run is already in flight
    pub const ALREADY_RUNNING: i32 = 1001;

    /// No tokio runtime available to host the run worker
    pub const RUNTIME_UNAVAILABLE: i32 = 1002;

    /// Run options failed validation
    pub const INVALID_OPTIONS: i32 = 1003;

    /// A stage failed
    pub const STAGE_FAILED: i32 = 1004;

    /// Detection engine error
    pub const DETECTION: i32 = 1005;

    /// External backend error
    pub const BACKEND: i32 = 1006;

    /// Mutex/RwLock was poisoned
    pub const LOCK_POISONED: i32 = 1007;

    /// Run cancelled at a stage boundary
    pub const CANCELLED: i32 = 1008;
}

/// Log a pipeline error with structured context
pub fn log_pipeline_error(err: &PipelineError, context: &str) {
    error!(
        "Pipeline error in {}: code={}, component=PipelineOrchestrator, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Pipeline-level errors
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Single-flight violation
    AlreadyRunning,

    /// `start` called outside a tokio runtime
    RuntimeUnavailable,

    /// Options rejected before the run started
    InvalidOptions { reason: String },

    /// Stage failed for a reason not covered by another variant
    StageFailed { stage: StageId, reason: String },

    /// Detection engine error
    Detection(DetectionError),

    /// External backend error
    Backend(BackendError),

    /// Lock poisoned
    LockPoisoned { component: String },

    /// Cancellation observed between stages
    Cancelled,
}

impl PipelineError {
    /// Whether this error is the result of cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Detection(DetectionError::Cancelled)
                | PipelineError::Backend(BackendError::Cancelled)
        )
    }
}

impl ErrorCode for PipelineError {
    fn code(&self) -> i32 {
        match self {
            PipelineError::AlreadyRunning => PipelineErrorCodes::ALREADY_RUNNING,
            PipelineError::RuntimeUnavailable => PipelineErrorCodes::RUNTIME_UNAVAILABLE,
            PipelineError::InvalidOptions { .. } => PipelineErrorCodes::INVALID_OPTIONS,
            PipelineError::StageFailed { .. } => PipelineErrorCodes::STAGE_FAILED,
            PipelineError::Detection(_) => PipelineErrorCodes::DETECTION,
            PipelineError::Backend(_) => PipelineErrorCodes::BACKEND,
            PipelineError::LockPoisoned { .. } => PipelineErrorCodes::LOCK_POISONED,
            PipelineError::Cancelled => PipelineErrorCodes::CANCELLED,
        }
    }

    fn message(&self) -> String {
        match self {
            PipelineError::AlreadyRunning => {
                "A pipeline run is already in progress. Cancel it or wait for it to finish."
                    .to_string()
            }
            PipelineError::RuntimeUnavailable => {
                "No tokio runtime available to start the pipeline".to_string()
            }
            PipelineError::InvalidOptions { reason } => format!("Invalid options: {}", reason),
            PipelineError::StageFailed { stage, reason } => {
                format!("Stage {} failed: {}", stage.label(), reason)
            }
            PipelineError::Detection(err) => err.message(),
            PipelineError::Backend(err) => err.message(),
            PipelineError::LockPoisoned { component } => {
                format!("Lock poisoned for component: {}", component)
            }
            PipelineError::Cancelled => "Pipeline run cancelled".to_string(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipelineError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for PipelineError {}

impl From<DetectionError> for PipelineError {
    fn from(err: DetectionError) -> Self {
        PipelineError::Detection(err)
    }
}

impl From<BackendError> for PipelineError {
    fn from(err: BackendError) -> Self {
        PipelineError::Backend(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_codes() {
        assert_eq!(PipelineError::AlreadyRunning.code(), 1001);
        assert_eq!(PipelineError::RuntimeUnavailable.code(), 1002);
        assert_eq!(
            PipelineError::InvalidOptions {
                reason: "x".to_string()
            }
            .code(),
            1003
        );
        assert_eq!(
            PipelineError::StageFailed {
                stage: StageId::DraftMapping,
                reason: "x".to_string()
            }
            .code(),
            1004
        );
        assert_eq!(PipelineError::Detection(DetectionError::Cancelled).code(), 1005);
        assert_eq!(PipelineError::Backend(BackendError::Cancelled).code(), 1006);
        assert_eq!(
            PipelineError::LockPoisoned {
                component: "x".to_string()
            }
            .code(),
            1007
        );
        assert_eq!(PipelineError::Cancelled.code(), 1008);
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(PipelineError::from(DetectionError::Cancelled).is_cancellation());
        assert!(PipelineError::from(BackendError::Cancelled).is_cancellation());
        assert!(PipelineError::Cancelled.is_cancellation());
        assert!(!PipelineError::AlreadyRunning.is_cancellation());
        assert!(!PipelineError::from(BackendError::Failed {
            reason: "boom".to_string()
        })
        .is_cancellation());
    }

    #[test]
    fn test_stage_failed_message_names_stage() {
        let err = PipelineError::StageFailed {
            stage: StageId::DraftMapping,
            reason: "no hits".to_string(),
        };
        assert!(err.message().contains("draft_mapping"));
        assert!(err.message().contains("no hits"));
    }

    #[test]
    fn test_error_propagation() {
        fn may_fail() -> Result<(), DetectionError> {
            Err(DetectionError::Cancelled)
        }

        fn caller() -> Result<(), PipelineError> {
            may_fail()?;
            Ok(())
        }

        assert!(caller().unwrap_err().is_cancellation());
    }
}
