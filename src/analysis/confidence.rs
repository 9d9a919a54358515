//! ConfidenceScorer - single detection confidence score plus guidance
//!
//! ```text
//! confidence = 0.45·coverage + 0.25·avgPeakConfidence
//!            + 0.15·clamp(maxDensity/5, 0, 1)
//!            + 0.15·(1 − clamp(meanErrorMs/20, 0, 1))
//!            − clamp((18 − peakCount)/40, 0, 0.25)   (only when peakCount < 18)
//! ```
//! clamped to [0, 1]. Below the caller's threshold the report lists the
//! specific reasons and tells the caller to stop forcing quantization.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{DetectionConfig, ScoringConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceInputs {
    pub coverage: f64,
    pub avg_peak_confidence: f64,
    /// Highest section density (onsets per second)
    pub max_density: f64,
    pub mean_error_ms: f64,
    pub peak_count: usize,
}

/// Specific cause of a low-confidence result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LowConfidenceReason {
    TooFewPeaks { count: usize, minimum: usize },
    WeakPeaks { average: f64, minimum: f64 },
    LowCoverage { coverage: f64, minimum: f64 },
    HighGridError { mean_error_ms: f64, maximum_ms: f64 },
}

impl fmt::Display for LowConfidenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowConfidenceReason::TooFewPeaks { count, minimum } => {
                write!(f, "only {} onsets detected (need {})", count, minimum)
            }
            LowConfidenceReason::WeakPeaks { average, minimum } => write!(
                f,
                "average onset confidence {:.2} below {:.2}",
                average, minimum
            ),
            LowConfidenceReason::LowCoverage { coverage, minimum } => write!(
                f,
                "grid coverage {:.0}% below {:.0}%",
                coverage * 100.0,
                minimum * 100.0
            ),
            LowConfidenceReason::HighGridError {
                mean_error_ms,
                maximum_ms,
            } => write!(
                f,
                "mean grid error {:.1} ms above {:.1} ms",
                mean_error_ms, maximum_ms
            ),
        }
    }
}

/// Confidence score and what the caller must do about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    /// Combined confidence (0.0-1.0)
    pub score: f64,
    pub threshold: f64,
    pub is_low: bool,
    pub reasons: Vec<LowConfidenceReason>,
    /// Human-readable warning, present only when `is_low`
    pub guidance: Option<String>,
    /// Upper bound for downbeat confidence, present only when `is_low`
    pub downbeat_cap: Option<f64>,
}

impl ConfidenceReport {
    /// Forced quantization must be disabled for low-confidence results
    pub fn allows_forced_quantization(&self) -> bool {
        !self.is_low
    }
}

pub struct ConfidenceScorer {
    scoring: ScoringConfig,
    detection: DetectionConfig,
}

impl ConfidenceScorer {
    pub fn new(scoring: &ScoringConfig, detection: &DetectionConfig) -> Self {
        Self {
            scoring: scoring.clone(),
            detection: detection.clone(),
        }
    }

    /// Combined score in [0, 1]; non-finite inputs count as zero
    pub fn score(&self, inputs: &ConfidenceInputs) -> f64 {
        let s = &self.scoring;

        let coverage = finite_or_zero(inputs.coverage).clamp(0.0, 1.0);
        let avg_peak = finite_or_zero(inputs.avg_peak_confidence).clamp(0.0, 1.0);
        let density_score = (finite_or_zero(inputs.max_density) / s.density_scale).clamp(0.0, 1.0);
        let error_score =
            1.0 - (finite_or_zero(inputs.mean_error_ms) / s.confidence_error_scale_ms).clamp(0.0, 1.0);

        let mut score = s.coverage_weight * coverage
            + s.peak_confidence_weight * avg_peak
            + s.density_weight * density_score
            + s.error_weight * error_score;

        if inputs.peak_count < s.sparse_peak_count {
            let missing = (s.sparse_peak_count - inputs.peak_count) as f64;
            score -= (missing / s.sparse_penalty_divisor).clamp(0.0, s.sparse_penalty_cap);
        }

        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Score the inputs and build guidance when below `threshold`
    pub fn assess(&self, inputs: &ConfidenceInputs, threshold: f64) -> ConfidenceReport {
        let score = self.score(inputs);
        let is_low = score < threshold;

        if !is_low {
            return ConfidenceReport {
                score,
                threshold,
                is_low,
                reasons: Vec::new(),
                guidance: None,
                downbeat_cap: None,
            };
        }

        let reasons = self.reasons(inputs);
        let cap = self.detection.downbeat_confidence_cap;

        let detail = if reasons.is_empty() {
            "combined signal is weak".to_string()
        } else {
            reasons
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        };

        let guidance = format!(
            "Low detection confidence ({:.2} < {:.2}): {}. Avoid forcing quantization and cap downbeat confidence at {:.2}.",
            score, threshold, detail, cap
        );

        ConfidenceReport {
            score,
            threshold,
            is_low,
            reasons,
            guidance: Some(guidance),
            downbeat_cap: Some(cap),
        }
    }

    fn reasons(&self, inputs: &ConfidenceInputs) -> Vec<LowConfidenceReason> {
        let d = &self.detection;
        let mut reasons = Vec::new();

        if inputs.peak_count < d.low_confidence_min_peaks {
            reasons.push(LowConfidenceReason::TooFewPeaks {
                count: inputs.peak_count,
                minimum: d.low_confidence_min_peaks,
            });
        }
        if inputs.avg_peak_confidence < d.low_confidence_min_avg_peak {
            reasons.push(LowConfidenceReason::WeakPeaks {
                average: inputs.avg_peak_confidence,
                minimum: d.low_confidence_min_avg_peak,
            });
        }
        if inputs.coverage < d.low_confidence_min_coverage {
            reasons.push(LowConfidenceReason::LowCoverage {
                coverage: inputs.coverage,
                minimum: d.low_confidence_min_coverage,
            });
        }
        if inputs.mean_error_ms > d.low_confidence_max_mean_error_ms {
            reasons.push(LowConfidenceReason::HighGridError {
                mean_error_ms: inputs.mean_error_ms,
                maximum_ms: d.low_confidence_max_mean_error_ms,
            });
        }

        reasons
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
