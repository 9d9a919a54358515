// Pipeline module - staged, cancellable orchestration of one drafting run
//
// Architecture:
// - StageId / ProgressWeighting: fixed stage plan mapped onto one progress bar
// - ProgressPublisher: single writer of a run's event stream
// - HeartbeatEmitter: periodic liveness re-emission of the last event
// - RunState / PipelineResult: per-run accumulator and its terminal snapshot
// - PipelineOrchestrator: sequences the stages against pluggable backends

pub mod heartbeat;
pub mod options;
pub mod orchestrator;
pub mod progress;
pub mod result;
pub mod stage;

pub use heartbeat::HeartbeatEmitter;
pub use options::{PipelineOptions, PipelineRequest};
pub use orchestrator::{PipelineBackends, PipelineOrchestrator};
pub use progress::{ProgressEvent, ProgressPublisher};
pub use result::{
    LogLevel, PipelineOutcome, PipelineResult, RunLogEntry, RunState, SeparationReport,
};
pub use stage::{PipelineState, ProgressWeighting, StageId};
