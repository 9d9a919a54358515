// Stage plan and weighted progress
//
// Every stage owns a fixed share of the global progress bar. Offsets are
// accumulated in order so the end of stage N is bit-identical to the start
// of stage N+1, and the final stage at local progress 1.0 maps to 1.0.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    AudioInit,
    ModelLoad,
    Separation,
    DecodePcm,
    OnsetDetection,
    TempoGrid,
    DraftMapping,
    Finalise,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::AudioInit,
        StageId::ModelLoad,
        StageId::Separation,
        StageId::DecodePcm,
        StageId::OnsetDetection,
        StageId::TempoGrid,
        StageId::DraftMapping,
        StageId::Finalise,
    ];

    /// Default share of global progress
    pub fn default_weight(self) -> f64 {
        match self {
            StageId::AudioInit => 0.02,
            StageId::ModelLoad => 0.08,
            StageId::Separation => 0.35,
            StageId::DecodePcm => 0.05,
            StageId::OnsetDetection => 0.15,
            StageId::TempoGrid => 0.10,
            StageId::DraftMapping => 0.20,
            StageId::Finalise => 0.05,
        }
    }

    /// Stable snake_case identifier used in logs and serialized maps
    pub fn label(self) -> &'static str {
        match self {
            StageId::AudioInit => "audio_init",
            StageId::ModelLoad => "model_load",
            StageId::Separation => "separation",
            StageId::DecodePcm => "decode_pcm",
            StageId::OnsetDetection => "onset_detection",
            StageId::TempoGrid => "tempo_grid",
            StageId::DraftMapping => "draft_mapping",
            StageId::Finalise => "finalise",
        }
    }

    /// Human-readable name for status lines
    pub fn display_name(self) -> &'static str {
        match self {
            StageId::AudioInit => "Preparing audio",
            StageId::ModelLoad => "Loading separation model",
            StageId::Separation => "Isolating drums",
            StageId::DecodePcm => "Decoding audio",
            StageId::OnsetDetection => "Detecting onsets",
            StageId::TempoGrid => "Resolving tempo grid",
            StageId::DraftMapping => "Building draft",
            StageId::Finalise => "Finalising",
        }
    }

    pub fn index(self) -> usize {
        StageId::ALL
            .iter()
            .position(|s| *s == self)
            .unwrap_or(StageId::ALL.len() - 1)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a run currently is, including the mutually exclusive terminal states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    Running(StageId),
    Completed,
    Cancelled,
    Faulted,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::Running(_))
    }
}

/// Maps (stage, local progress) onto one monotonic global fraction
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressWeighting {
    weights: [f64; 8],
    starts: [f64; 8],
}

impl ProgressWeighting {
    /// Build a weighting from explicit per-stage weights
    ///
    /// Weights must be finite, non-negative and sum to 1.0 (±1e-6).
    pub fn new(weights: [f64; 8]) -> Result<Self, PipelineError> {
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::InvalidOptions {
                reason: "stage weights must be finite and non-negative".to_string(),
            });
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(PipelineError::InvalidOptions {
                reason: format!("stage weights must sum to 1.0 (got {:.6})", total),
            });
        }

        Ok(Self::accumulate(weights))
    }

    fn accumulate(weights: [f64; 8]) -> Self {
        let mut starts = [0.0; 8];
        for i in 1..weights.len() {
            starts[i] = starts[i - 1] + weights[i - 1];
        }
        Self { weights, starts }
    }

    pub fn weight(&self, stage: StageId) -> f64 {
        self.weights[stage.index()]
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Global progress in [0, 1]
    pub fn global_progress(&self, stage: StageId, local: f32) -> f64 {
        let local = if local.is_finite() {
            (local as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let index = stage.index();

        if index == self.weights.len() - 1 && local >= 1.0 {
            return 1.0;
        }

        (self.starts[index] + self.weights[index] * local).clamp(0.0, 1.0)
    }

    /// Global progress in [0, 100]
    pub fn global_percent(&self, stage: StageId, local: f32) -> f64 {
        self.global_progress(stage, local) * 100.0
    }
}

impl Default for ProgressWeighting {
    fn default() -> Self {
        Self::accumulate(StageId::ALL.map(StageId::default_weight))
    }
}
