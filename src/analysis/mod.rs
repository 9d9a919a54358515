// Analysis module - offline onset detection and grid quantization
//
// This module turns a bucketed waveform summary into onsets, a tempo
// estimate and a scored quantization grid.
//
// Architecture:
// - EnvelopeBuilder: waveform extrema → normalized envelope + adaptive threshold
// - PeakDetector: envelope → OnsetPeak list
// - TempoEstimator / SectionProfiler: peaks → base BPM / density sections
// - TempoCandidateSelector: base BPM → scored grid candidates (alias authority)
// - ConfidenceScorer: candidates + peaks → confidence report and guidance

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::DetectionError;

pub mod candidates;
pub mod confidence;
pub mod envelope;
pub mod onset;
pub mod quantizer;
pub mod sections;
pub mod tempo;


use candidates::{CandidateRequest, TempoCandidateSelector};
use confidence::{ConfidenceInputs, ConfidenceReport, ConfidenceScorer};
use envelope::{EnvelopeBuilder, EnvelopeParams};
use onset::PeakDetector;
use quantizer::{GridKind, QuantizationSummary};
use sections::{Section, SectionProfiler};
use tempo::TempoEstimator;

/// Number of buckets processed between cancellation checks in tight loops
pub(crate) const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Cooperative cancellation probe used inside CPU-bound loops
pub trait CancelCheck {
    fn is_cancelled(&self) -> bool;
}

impl CancelCheck for CancellationToken {
    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

/// Probe that never cancels, for synchronous callers and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancelCheck for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Bucketed min/max amplitude summary of a decoded track
///
/// Owned by the detection stage; treated as read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformSummary {
    pub sample_rate: u32,
    /// Duration covered by one bucket (seconds)
    pub bucket_seconds: f64,
    pub mins: Vec<f32>,
    pub maxs: Vec<f32>,
    pub duration_seconds: f64,
}

impl WaveformSummary {
    /// Create a summary from precomputed bucket extrema
    pub fn new(
        sample_rate: u32,
        bucket_seconds: f64,
        mins: Vec<f32>,
        maxs: Vec<f32>,
        duration_seconds: f64,
    ) -> Result<Self, DetectionError> {
        let summary = Self {
            sample_rate,
            bucket_seconds,
            mins,
            maxs,
            duration_seconds,
        };
        summary.validate()?;
        Ok(summary)
    }

    /// Summarise interleaved PCM samples into min/max buckets
    ///
    /// Channels are averaged to mono before bucketing.
    pub fn from_samples(
        samples: &[f32],
        channels: u16,
        sample_rate: u32,
        bucket_seconds: f64,
    ) -> Result<Self, DetectionError> {
        if channels == 0 {
            return Err(DetectionError::InvalidWaveform {
                reason: "channel count must be at least 1".to_string(),
            });
        }
        if sample_rate == 0 {
            return Err(DetectionError::InvalidWaveform {
                reason: "sample rate must be positive".to_string(),
            });
        }
        if !bucket_seconds.is_finite() || bucket_seconds <= 0.0 {
            return Err(DetectionError::InvalidWaveform {
                reason: format!("bucket duration must be positive (got {})", bucket_seconds),
            });
        }

        let channels = channels as usize;
        let frames = samples.len() / channels;
        let frames_per_bucket = ((bucket_seconds * sample_rate as f64).round() as usize).max(1);
        let bucket_count = frames.div_ceil(frames_per_bucket);

        let mut mins = Vec::with_capacity(bucket_count);
        let mut maxs = Vec::with_capacity(bucket_count);

        for bucket in samples.chunks(frames_per_bucket * channels) {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for frame in bucket.chunks_exact(channels) {
                let mono = frame.iter().sum::<f32>() / channels as f32;
                lo = lo.min(mono);
                hi = hi.max(mono);
            }
            if lo.is_finite() && hi.is_finite() {
                mins.push(lo);
                maxs.push(hi);
            }
        }

        Self::new(
            sample_rate,
            frames_per_bucket as f64 / sample_rate as f64,
            mins,
            maxs,
            frames as f64 / sample_rate as f64,
        )
    }

    pub fn bucket_count(&self) -> usize {
        self.maxs.len()
    }

    fn validate(&self) -> Result<(), DetectionError> {
        if !self.bucket_seconds.is_finite() || self.bucket_seconds <= 0.0 {
            return Err(DetectionError::InvalidWaveform {
                reason: format!(
                    "bucket duration must be positive (got {})",
                    self.bucket_seconds
                ),
            });
        }
        if self.mins.len() != self.maxs.len() {
            return Err(DetectionError::InvalidWaveform {
                reason: format!(
                    "min/max bucket counts differ ({} vs {})",
                    self.mins.len(),
                    self.maxs.len()
                ),
            });
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(DetectionError::InvalidWaveform {
                reason: format!("invalid duration {}", self.duration_seconds),
            });
        }
        Ok(())
    }
}

/// A detected percussive onset
///
/// Immutable once created; detection returns them ordered by time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnsetPeak {
    pub time_seconds: f64,
    /// Detection confidence (0.0-1.0)
    pub confidence: f32,
    /// Un-normalized bucket amplitude
    pub amplitude: f32,
    /// Normalized adaptive threshold at the peak bucket
    pub threshold: f32,
    pub bucket_index: usize,
    /// Synthetic decay series at 100/75/45/25% of the amplitude,
    /// consumed by draft builders for velocity bucketing
    pub harmonics: [f32; 4],
}

/// Output of the onset detection phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnsetDetection {
    pub peaks: Vec<OnsetPeak>,
    pub base_bpm: f64,
    pub sections: Vec<Section>,
    pub duration_seconds: f64,
    pub params: EnvelopeParams,
}

impl OnsetDetection {
    pub fn peak_times(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.time_seconds).collect()
    }
}

/// Grid request for the quantize phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizeOptions {
    pub grid: GridKind,
    pub max_snap_error_ms: f64,
    /// Confidence below which guidance is raised
    pub confidence_threshold: f64,
    pub forced_bpm: Option<f64>,
    pub forced_offset_seconds: Option<f64>,
    pub forced_step_seconds: Option<f64>,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            grid: GridKind::Sixteenth,
            max_snap_error_ms: 35.0,
            confidence_threshold: 0.6,
            forced_bpm: None,
            forced_offset_seconds: None,
            forced_step_seconds: None,
        }
    }
}

/// Aggregated detection view computed once per quantize stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionStats {
    pub duration_seconds: f64,
    pub peak_count: usize,
    pub avg_peak_confidence: f64,
    pub max_density: f64,
    pub base_bpm: f64,
    pub window_buckets: usize,
    pub min_separation_buckets: usize,
    pub peaks: Vec<OnsetPeak>,
    pub sections: Vec<Section>,
    pub quantization: QuantizationSummary,
    pub confidence: ConfidenceReport,
    /// Octave alias warning, if a competing alias exists
    pub ambiguity: Option<String>,
}

impl DetectionStats {
    /// Recoverable and ambiguous conditions raised by this analysis
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(guidance) = &self.confidence.guidance {
            warnings.push(guidance.clone());
        }
        if let Some(ambiguity) = &self.ambiguity {
            warnings.push(ambiguity.clone());
        }
        warnings
    }
}

/// Facade running the full detection → quantize chain
#[derive(Debug, Clone, Default)]
pub struct OnsetAnalyzer {
    config: AppConfig,
}

impl OnsetAnalyzer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Detect onsets, estimate tempo and profile sections
    ///
    /// `on_progress` receives local progress in 0.0-1.0 as phases complete.
    pub fn detect_onsets(
        &self,
        waveform: &WaveformSummary,
        sensitivity: f64,
        cancel: &dyn CancelCheck,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<OnsetDetection, DetectionError> {
        if !sensitivity.is_finite() {
            return Err(DetectionError::InvalidOptions {
                reason: format!("sensitivity must be finite (got {})", sensitivity),
            });
        }

        on_progress(0.0);
        let envelope = EnvelopeBuilder::build(waveform, sensitivity, cancel)?;
        on_progress(0.45);

        let detector = PeakDetector::new(envelope.params.min_separation_buckets);
        let peaks = detector.detect(&envelope, waveform.bucket_seconds, cancel)?;
        on_progress(0.85);

        let base_bpm = TempoEstimator::new(&self.config.detection).estimate(&peaks);
        let sections = SectionProfiler::profile(&peaks, waveform.duration_seconds);
        on_progress(1.0);

        tracing::debug!(
            peaks = peaks.len(),
            base_bpm,
            window_buckets = envelope.params.window_buckets,
            "onset detection complete"
        );

        Ok(OnsetDetection {
            peaks,
            base_bpm,
            sections,
            duration_seconds: waveform.duration_seconds,
            params: envelope.params,
        })
    }

    /// Resolve the quantization grid and score detection confidence
    pub fn quantize(&self, detection: &OnsetDetection, options: &QuantizeOptions) -> DetectionStats {
        let selector =
            TempoCandidateSelector::new(&self.config.scoring, &self.config.detection);
        let selection = selector.select(&CandidateRequest {
            peak_times: detection.peak_times(),
            base_bpm: detection.base_bpm,
            grid: options.grid,
            max_snap_error_ms: options.max_snap_error_ms,
            forced_bpm: options.forced_bpm,
            forced_offset_seconds: options.forced_offset_seconds,
            forced_step_seconds: options.forced_step_seconds,
        });

        let peak_count = detection.peaks.len();
        let avg_peak_confidence = if peak_count == 0 {
            0.0
        } else {
            detection
                .peaks
                .iter()
                .map(|p| p.confidence as f64)
                .sum::<f64>()
                / peak_count as f64
        };
        let max_density = detection
            .sections
            .iter()
            .map(|s| s.density)
            .fold(0.0_f64, f64::max);

        let scorer = ConfidenceScorer::new(&self.config.scoring, &self.config.detection);
        let confidence = scorer.assess(
            &ConfidenceInputs {
                coverage: selection.summary.primary.coverage,
                avg_peak_confidence,
                max_density,
                mean_error_ms: selection.summary.primary.mean_error_ms,
                peak_count,
            },
            options.confidence_threshold,
        );

        DetectionStats {
            duration_seconds: detection.duration_seconds,
            peak_count,
            avg_peak_confidence,
            max_density,
            base_bpm: detection.base_bpm,
            window_buckets: detection.params.window_buckets,
            min_separation_buckets: detection.params.min_separation_buckets,
            peaks: detection.peaks.clone(),
            sections: detection.sections.clone(),
            quantization: selection.summary,
            confidence,
            ambiguity: selection.ambiguity,
        }
    }

    /// Run detection and quantization back to back
    pub fn analyze(
        &self,
        waveform: &WaveformSummary,
        sensitivity: f64,
        options: &QuantizeOptions,
        cancel: &dyn CancelCheck,
    ) -> Result<DetectionStats, DetectionError> {
        let detection = self.detect_onsets(waveform, sensitivity, cancel, &mut |_| {})?;
        Ok(self.quantize(&detection, options))
    }
}
