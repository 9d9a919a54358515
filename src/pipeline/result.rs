// PipelineResult + RunState
//
// RunState is the per-run accumulator owned by the orchestrator: logs,
// warnings, stage timings and whatever partial analysis exists. It is
// consumed exactly once into the immutable PipelineResult.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::progress::now_timestamp_ms;
use super::stage::{PipelineState, StageId};
use crate::analysis::{DetectionStats, WaveformSummary};
use crate::engine::backend::Draft;
use crate::telemetry::{self, MetricEvent};

/// Separator used when merging warnings into one line
pub const WARNING_SEPARATOR: &str = " | ";

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success,
    Failure { reason: String },
    Cancelled,
}

impl PipelineOutcome {
    pub fn final_state(&self) -> PipelineState {
        match self {
            PipelineOutcome::Success => PipelineState::Completed,
            PipelineOutcome::Failure { .. } => PipelineState::Faulted,
            PipelineOutcome::Cancelled => PipelineState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Timestamped entry of the per-run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp_ms: u64,
    /// Milliseconds since the run started
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub stage: Option<StageId>,
    pub message: String,
}

/// Which separation backend produced the analysed audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationReport {
    pub backend: String,
    pub is_passthrough: bool,
    pub drums_path: PathBuf,
    /// Why the preferred backend was not used, if it was not
    pub fallback_reason: Option<String>,
}

/// Terminal result of one run; created once and never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: u64,
    pub outcome: PipelineOutcome,
    pub final_state: PipelineState,
    pub warnings: Vec<String>,
    /// All warnings merged into one line
    pub warning: Option<String>,
    pub logs: Vec<RunLogEntry>,
    pub detection_stats: Option<DetectionStats>,
    pub waveform: Option<WaveformSummary>,
    pub separation: Option<SeparationReport>,
    pub draft: Option<Draft>,
    pub stage_durations: BTreeMap<StageId, u64>,
    pub total_duration_ms: u64,
    /// Metric events this run published, in order
    pub telemetry: Vec<MetricEvent>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Success)
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Cancelled)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            PipelineOutcome::Failure { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Mutable per-run accumulator
pub struct RunState {
    run_id: u64,
    started: Instant,
    active_stage: Option<(StageId, Instant)>,
    pub logs: Vec<RunLogEntry>,
    pub warnings: Vec<String>,
    pub stage_durations: BTreeMap<StageId, u64>,
    pub detection_stats: Option<DetectionStats>,
    pub waveform: Option<WaveformSummary>,
    pub separation: Option<SeparationReport>,
    pub draft: Option<Draft>,
    pub telemetry: Vec<MetricEvent>,
}

impl RunState {
    pub fn new(run_id: u64) -> Self {
        Self {
            run_id,
            started: Instant::now(),
            active_stage: None,
            logs: Vec::new(),
            warnings: Vec::new(),
            stage_durations: BTreeMap::new(),
            detection_stats: None,
            waveform: None,
            separation: None,
            draft: None,
            telemetry: Vec::new(),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn log(&mut self, level: LogLevel, stage: Option<StageId>, message: impl Into<String>) {
        let message = message.into();
        let stage_label = stage.map(StageId::label).unwrap_or("run");
        match level {
            LogLevel::Info => tracing::info!(run_id = self.run_id, stage = stage_label, "{}", message),
            LogLevel::Warn => tracing::warn!(run_id = self.run_id, stage = stage_label, "{}", message),
            LogLevel::Error => tracing::error!(run_id = self.run_id, stage = stage_label, "{}", message),
        }

        self.logs.push(RunLogEntry {
            timestamp_ms: now_timestamp_ms(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            level,
            stage,
            message,
        });
    }

    /// Record a recoverable condition; duplicates are ignored
    pub fn warn(&mut self, stage: Option<StageId>, message: impl Into<String>) {
        let message = message.into();
        if self.warnings.contains(&message) {
            return;
        }
        self.log(LogLevel::Warn, stage, message.clone());
        self.warnings.push(message);
    }

    /// Publish `event` on the global hub and keep it for the result
    pub fn record_metric(&mut self, event: MetricEvent) {
        telemetry::hub().record(event.clone());
        self.telemetry.push(event);
    }

    pub fn merged_warning(&self) -> Option<String> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(self.warnings.join(WARNING_SEPARATOR))
        }
    }

    /// Start timing a stage, closing any stage still open
    pub fn begin_stage(&mut self, stage: StageId) {
        self.end_active_stage();
        self.active_stage = Some((stage, Instant::now()));
    }

    /// Stop timing the open stage and add its elapsed time
    ///
    /// Revisited stages accumulate.
    pub fn end_active_stage(&mut self) -> Option<(StageId, u64)> {
        let (stage, started) = self.active_stage.take()?;
        let elapsed = started.elapsed().as_millis() as u64;
        *self.stage_durations.entry(stage).or_insert(0) += elapsed;
        Some((stage, elapsed))
    }

    pub fn active_stage(&self) -> Option<StageId> {
        self.active_stage.map(|(stage, _)| stage)
    }

    /// Close the run into its terminal result
    pub fn into_result(mut self, outcome: PipelineOutcome) -> PipelineResult {
        self.end_active_stage();
        let warning = self.merged_warning();

        PipelineResult {
            run_id: self.run_id,
            final_state: outcome.final_state(),
            outcome,
            warnings: self.warnings,
            warning,
            logs: self.logs,
            detection_stats: self.detection_stats,
            waveform: self.waveform,
            separation: self.separation,
            draft: self.draft,
            stage_durations: self.stage_durations,
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            telemetry: self.telemetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_warnings_deduplicated_and_merged() {
        let mut state = RunState::new(1);
        state.warn(Some(StageId::ModelLoad), "model load timed out");
        state.warn(Some(StageId::Separation), "model load timed out");
        state.warn(Some(StageId::TempoGrid), "low confidence");

        assert_eq!(state.warnings.len(), 2);
        assert_eq!(
            state.merged_warning().as_deref(),
            Some("model load timed out | low confidence")
        );
        assert_eq!(state.logs.len(), 2);
    }

    #[test]
    fn test_revisited_stage_accumulates() {
        let mut state = RunState::new(1);
        state.begin_stage(StageId::ModelLoad);
        thread::sleep(Duration::from_millis(5));
        state.end_active_stage();
        state.begin_stage(StageId::ModelLoad);
        thread::sleep(Duration::from_millis(5));
        let (_, second) = state.end_active_stage().unwrap();

        let total = state.stage_durations[&StageId::ModelLoad];
        assert!(total >= 10);
        assert!(total > second);
    }

    #[test]
    fn test_into_result_closes_open_stage() {
        let mut state = RunState::new(3);
        state.begin_stage(StageId::OnsetDetection);
        let result = state.into_result(PipelineOutcome::Failure {
            reason: "boom".to_string(),
        });

        assert!(result.stage_durations.contains_key(&StageId::OnsetDetection));
        assert_eq!(result.final_state, PipelineState::Faulted);
        assert_eq!(result.failure_reason(), Some("boom"));
        assert!(!result.success());
        assert!(!result.cancelled());
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(PipelineOutcome::Success.final_state(), PipelineState::Completed);
        assert_eq!(PipelineOutcome::Cancelled.final_state(), PipelineState::Cancelled);
    }

    #[test]
    fn test_result_serializes_stage_map() {
        let mut state = RunState::new(9);
        state.stage_durations.insert(StageId::DecodePcm, 4);
        let result = state.into_result(PipelineOutcome::Success);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stage_durations"]["decode_pcm"], 4);
        assert_eq!(json["outcome"]["kind"], "success");
    }

    #[test]
    fn test_recorded_metrics_travel_with_result() {
        let mut state = RunState::new(11);
        state.record_metric(MetricEvent::LowConfidence {
            run_id: 11,
            score: 0.4,
            threshold: 0.6,
        });
        let result = state.into_result(PipelineOutcome::Success);

        assert_eq!(result.telemetry.len(), 1);
        assert_eq!(result.telemetry[0].run_id(), Some(11));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["telemetry"][0]["type"], "low_confidence");
    }
}
