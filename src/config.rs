//! Configuration management for detection, scoring and pipeline tuning
//!
//! This module provides runtime configuration loading from JSON files so
//! the empirically chosen constants (confidence weights, error scales,
//! octave penalties) can be adjusted without recompilation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Onset detection and tempo estimation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Tempo returned when fewer than two usable onsets exist
    pub default_bpm: f64,
    /// Octave folding range applied to the raw interval tempo
    pub fold_min_bpm: f64,
    pub fold_max_bpm: f64,
    /// Final clamp applied after folding
    pub clamp_min_bpm: f64,
    pub clamp_max_bpm: f64,
    /// Inter-onset intervals outside this range are ignored (seconds)
    pub min_interval_seconds: f64,
    pub max_interval_seconds: f64,
    /// Number of leading peaks tried as grid offset anchors
    pub offset_search_peaks: usize,
    /// Bucket duration used when summarising raw PCM (seconds)
    pub bucket_seconds: f64,
    /// Peak count below which the result is reported as sparse
    pub low_confidence_min_peaks: usize,
    /// Average peak confidence below which the result is reported as weak
    pub low_confidence_min_avg_peak: f64,
    /// Grid coverage below which the result is reported as poorly aligned
    pub low_confidence_min_coverage: f64,
    /// Mean snap error above which the result is reported as loose (ms)
    pub low_confidence_max_mean_error_ms: f64,
    /// Downbeat confidence ceiling handed to the draft builder on low confidence
    pub downbeat_confidence_cap: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            default_bpm: 120.0,
            fold_min_bpm: 80.0,
            fold_max_bpm: 180.0,
            clamp_min_bpm: 60.0,
            clamp_max_bpm: 240.0,
            min_interval_seconds: 0.12,
            max_interval_seconds: 2.0,
            offset_search_peaks: 6,
            bucket_seconds: 0.01,
            low_confidence_min_peaks: 18,
            low_confidence_min_avg_peak: 0.55,
            low_confidence_min_coverage: 0.6,
            low_confidence_max_mean_error_ms: 12.0,
            downbeat_confidence_cap: 0.5,
        }
    }
}

/// Scoring constants for candidate selection and confidence
///
/// These values were tuned by ear against real tracks and have no derivation
/// beyond that; they are kept overridable for experiments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub coverage_weight: f64,
    pub peak_confidence_weight: f64,
    pub density_weight: f64,
    pub error_weight: f64,
    /// Peak density (onsets/s) mapped to a full density score
    pub density_scale: f64,
    /// Mean error (ms) mapped to a zero error score
    pub confidence_error_scale_ms: f64,
    /// Peak count below which the sparse penalty applies
    pub sparse_peak_count: usize,
    pub sparse_penalty_divisor: f64,
    pub sparse_penalty_cap: f64,
    /// Coverage distance treated as a tie between candidates
    pub tie_epsilon: f64,
    /// Coverage lead treated as decisive (also the octave ambiguity margin)
    pub decisive_lead: f64,
    pub tie_bonus: f64,
    pub decisive_bonus: f64,
    pub mean_error_scale_ms: f64,
    pub mean_error_penalty_cap: f64,
    pub median_error_scale_ms: f64,
    pub median_error_penalty_cap: f64,
    pub octave_penalty: f64,
    pub octave_penalty_cap: f64,
    /// Candidates closer than this (BPM) collapse into one
    pub alias_tolerance_bpm: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            coverage_weight: 0.45,
            peak_confidence_weight: 0.25,
            density_weight: 0.15,
            error_weight: 0.15,
            density_scale: 5.0,
            confidence_error_scale_ms: 20.0,
            sparse_peak_count: 18,
            sparse_penalty_divisor: 40.0,
            sparse_penalty_cap: 0.25,
            tie_epsilon: 0.01,
            decisive_lead: 0.05,
            tie_bonus: 0.03,
            decisive_bonus: 0.05,
            mean_error_scale_ms: 18.0,
            mean_error_penalty_cap: 0.35,
            median_error_scale_ms: 16.0,
            median_error_penalty_cap: 0.2,
            octave_penalty: 0.08,
            octave_penalty_cap: 2.0,
            alias_tolerance_bpm: 0.01,
        }
    }
}

/// Orchestration timing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Interval between liveness re-emissions
    pub heartbeat_interval_ms: u64,
    /// Budget for the separation model load before falling back
    pub model_load_timeout_ms: u64,
    /// Minimum spacing between intermediate progress events of one stage
    pub progress_throttle_ms: u64,
    /// Capacity of the observer broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            model_load_timeout_ms: 30_000,
            progress_throttle_ms: 50,
            event_channel_capacity: 256,
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// Missing sections fall back to their defaults. If the file doesn't
    /// exist or the JSON is invalid, the full default config is returned.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.detection.default_bpm, 120.0);
        assert_eq!(config.scoring.coverage_weight, 0.45);
        assert_eq!(config.scoring.octave_penalty, 0.08);
        assert_eq!(config.pipeline.heartbeat_interval_ms, 500);
    }

    #[test]
    fn test_confidence_weights_sum_to_one() {
        let s = ScoringConfig::default();
        let sum = s.coverage_weight + s.peak_confidence_weight + s.density_weight + s.error_weight;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_json_uses_section_defaults() {
        let json = r#"{ "pipeline": { "heartbeat_interval_ms": 100 } }"#;
        let parsed: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.pipeline.heartbeat_interval_ms, 100);
        assert_eq!(parsed.pipeline.model_load_timeout_ms, 30_000);
        assert_eq!(parsed.scoring.mean_error_scale_ms, 18.0);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_file("/definitely/not/here/drafter.json");
        assert_eq!(config.detection.offset_search_peaks, 6);
    }
}
