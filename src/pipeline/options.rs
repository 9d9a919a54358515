// Run options supplied by the caller

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::analysis::quantizer::GridKind;
use crate::analysis::QuantizeOptions;
use crate::error::PipelineError;

/// Per-run options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Confidence below which low-confidence guidance is raised (0.0-1.0)
    pub confidence_threshold: f64,
    /// Onset detection sensitivity (0-100)
    pub detection_sensitivity: f64,
    pub quantization_grid: GridKind,
    pub max_snap_error_ms: f64,
    pub forced_bpm: Option<f64>,
    pub forced_offset_seconds: Option<f64>,
    pub forced_step_seconds: Option<f64>,
    /// Snap every onset to the grid; cleared automatically on low confidence
    pub force_quantization: bool,
    /// Run the separation backend; passthrough when false
    pub enable_separation: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            detection_sensitivity: 50.0,
            quantization_grid: GridKind::Sixteenth,
            max_snap_error_ms: 35.0,
            forced_bpm: None,
            forced_offset_seconds: None,
            forced_step_seconds: None,
            force_quantization: false,
            enable_separation: true,
        }
    }
}

impl PipelineOptions {
    /// Reject options the engine cannot act on
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.confidence_threshold.is_finite() || !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid(format!(
                "confidence threshold must be within 0-1 (got {})",
                self.confidence_threshold
            )));
        }
        if !self.detection_sensitivity.is_finite()
            || !(0.0..=100.0).contains(&self.detection_sensitivity)
        {
            return Err(invalid(format!(
                "detection sensitivity must be within 0-100 (got {})",
                self.detection_sensitivity
            )));
        }
        if !self.max_snap_error_ms.is_finite() || self.max_snap_error_ms <= 0.0 {
            return Err(invalid(format!(
                "max snap error must be positive (got {})",
                self.max_snap_error_ms
            )));
        }
        if let Some(bpm) = self.forced_bpm {
            if !bpm.is_finite() || bpm <= 0.0 {
                return Err(invalid(format!("forced bpm must be positive (got {})", bpm)));
            }
        }
        if let Some(step) = self.forced_step_seconds {
            if !step.is_finite() || step <= 0.0 {
                return Err(invalid(format!(
                    "forced step must be positive (got {})",
                    step
                )));
            }
        }
        if let Some(offset) = self.forced_offset_seconds {
            if !offset.is_finite() {
                return Err(invalid(format!(
                    "forced offset must be finite (got {})",
                    offset
                )));
            }
        }
        Ok(())
    }

    pub fn quantize_options(&self) -> QuantizeOptions {
        QuantizeOptions {
            grid: self.quantization_grid,
            max_snap_error_ms: self.max_snap_error_ms,
            confidence_threshold: self.confidence_threshold,
            forced_bpm: self.forced_bpm,
            forced_offset_seconds: self.forced_offset_seconds,
            forced_step_seconds: self.forced_step_seconds,
        }
    }
}

fn invalid(reason: String) -> PipelineError {
    PipelineError::InvalidOptions { reason }
}

/// Everything needed to start one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub audio_path: PathBuf,
    pub title: Option<String>,
    pub options: PipelineOptions,
}

impl PipelineRequest {
    pub fn new(audio_path: impl Into<PathBuf>) -> Self {
        Self {
            audio_path: audio_path.into(),
            title: None,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Track title, falling back to the audio file stem
    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.audio_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".to_string())
        })
    }
}
