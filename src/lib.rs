// Rhythm Drafter Core - onset detection, tempo grid resolution and
// cancellable drafting pipeline

// Module declarations
pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod telemetry;
pub mod testing;

// Re-exports for convenience
pub use analysis::{DetectionStats, OnsetAnalyzer, OnsetPeak, QuantizeOptions, WaveformSummary};
pub use config::AppConfig;
pub use engine::{RunCoordinator, RunHandle, RunSubscription};
pub use error::{BackendError, DetectionError, ErrorCode, PipelineError};
pub use pipeline::{
    PipelineBackends, PipelineOptions, PipelineOrchestrator, PipelineOutcome, PipelineRequest,
    PipelineResult, PipelineState, ProgressEvent, StageId,
};
