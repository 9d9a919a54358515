//! Metric event types published by pipeline runs.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::pipeline::progress::now_timestamp_ms;
use crate::pipeline::{PipelineState, StageId};

/// Metric events covering stage timing, backend fallbacks and run outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MetricEvent {
    StageCompleted {
        run_id: u64,
        stage: StageId,
        elapsed_ms: u64,
    },
    /// Rolling timing per stage across runs
    StageTiming {
        stage: StageId,
        avg_ms: f64,
        max_ms: u64,
        sample_count: usize,
    },
    SeparationFallback {
        run_id: u64,
        reason: String,
    },
    LowConfidence {
        run_id: u64,
        score: f64,
        threshold: f64,
    },
    RunFinished {
        run_id: u64,
        state: PipelineState,
        total_ms: u64,
        timestamp_ms: u64,
    },
    Error {
        code: i32,
        context: String,
    },
}

impl MetricEvent {
    pub fn run_finished(run_id: u64, state: PipelineState, total_ms: u64) -> Self {
        MetricEvent::RunFinished {
            run_id,
            state,
            total_ms,
            timestamp_ms: now_timestamp_ms(),
        }
    }

    pub fn error(err: &dyn ErrorCode, context: impl Into<String>) -> Self {
        MetricEvent::Error {
            code: err.code(),
            context: context.into(),
        }
    }

    /// Run the event belongs to; rolling timings and errors carry none
    pub fn run_id(&self) -> Option<u64> {
        match self {
            MetricEvent::StageCompleted { run_id, .. }
            | MetricEvent::SeparationFallback { run_id, .. }
            | MetricEvent::LowConfidence { run_id, .. }
            | MetricEvent::RunFinished { run_id, .. } => Some(*run_id),
            MetricEvent::StageTiming { .. } | MetricEvent::Error { .. } => None,
        }
    }
}
