// EnvelopeBuilder - normalized energy envelope with adaptive threshold
//
// Each bucket's peak magnitude max(|max|, |min|) is normalized against the
// loudest bucket of the track. The threshold at bucket i is a centered moving
// average of the envelope plus a sensitivity-dependent boost.
//
// Sensitivity (0-100) is normalized to s ∈ [0.05, 1.0]:
//   window     = 0.12 + 0.18 * (1 - s) seconds, clamped to [4, 160] buckets
//   boost      = 0.12 + 0.35 * (1 - s)
//   separation = 0.08 + 0.18 * (1 - s) seconds, at least 3 buckets

use serde::{Deserialize, Serialize};

use super::{CancelCheck, WaveformSummary, CANCEL_CHECK_INTERVAL};
use crate::error::DetectionError;

const MIN_NORMALIZED_SENSITIVITY: f64 = 0.05;
const MIN_WINDOW_BUCKETS: usize = 4;
const MAX_WINDOW_BUCKETS: usize = 160;
const MIN_SEPARATION_BUCKETS: usize = 3;

/// Parameters derived from sensitivity and bucket duration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeParams {
    /// Normalized sensitivity in [0.05, 1.0]
    pub sensitivity: f64,
    pub window_seconds: f64,
    pub window_buckets: usize,
    pub boost: f64,
    pub min_separation_seconds: f64,
    pub min_separation_buckets: usize,
}

impl EnvelopeParams {
    /// Derive envelope parameters from a raw 0-100 sensitivity
    ///
    /// Values outside 0-100 are clamped.
    pub fn from_sensitivity(raw_sensitivity: f64, bucket_seconds: f64) -> Self {
        let s = normalize_sensitivity(raw_sensitivity);
        let slack = 1.0 - s;

        let window_seconds = 0.12 + 0.18 * slack;
        let min_separation_seconds = 0.08 + 0.18 * slack;

        let window_buckets = seconds_to_buckets(window_seconds, bucket_seconds)
            .clamp(MIN_WINDOW_BUCKETS, MAX_WINDOW_BUCKETS);
        let min_separation_buckets = seconds_to_buckets(min_separation_seconds, bucket_seconds)
            .max(MIN_SEPARATION_BUCKETS);

        Self {
            sensitivity: s,
            window_seconds,
            window_buckets,
            boost: 0.12 + 0.35 * slack,
            min_separation_seconds,
            min_separation_buckets,
        }
    }
}

/// Map a raw 0-100 sensitivity to [0.05, 1.0]
pub fn normalize_sensitivity(raw: f64) -> f64 {
    if !raw.is_finite() {
        return MIN_NORMALIZED_SENSITIVITY;
    }
    (raw.clamp(0.0, 100.0) / 100.0).clamp(MIN_NORMALIZED_SENSITIVITY, 1.0)
}

fn seconds_to_buckets(seconds: f64, bucket_seconds: f64) -> usize {
    if !bucket_seconds.is_finite() || bucket_seconds <= 0.0 {
        return 0;
    }
    let buckets = (seconds / bucket_seconds).round();
    if buckets.is_finite() && buckets > 0.0 {
        // Saturating float-to-int cast keeps absurdly small buckets in range
        buckets as usize
    } else {
        0
    }
}

/// Normalized envelope and its adaptive threshold curve
#[derive(Debug, Clone)]
pub struct Envelope {
    pub values: Vec<f32>,
    pub threshold: Vec<f32>,
    /// Loudest bucket magnitude before normalization
    pub peak_amplitude: f32,
    pub params: EnvelopeParams,
}

impl Envelope {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub struct EnvelopeBuilder;

impl EnvelopeBuilder {
    /// Build the envelope and threshold for a waveform summary
    ///
    /// Checks `cancel` every few thousand buckets so long tracks stay
    /// responsive to cancellation.
    pub fn build(
        waveform: &WaveformSummary,
        raw_sensitivity: f64,
        cancel: &dyn CancelCheck,
    ) -> Result<Envelope, DetectionError> {
        if !waveform.bucket_seconds.is_finite() || waveform.bucket_seconds <= 0.0 {
            return Err(DetectionError::InvalidWaveform {
                reason: format!(
                    "bucket duration must be positive (got {})",
                    waveform.bucket_seconds
                ),
            });
        }
        if waveform.mins.len() != waveform.maxs.len() {
            return Err(DetectionError::InvalidWaveform {
                reason: "min/max bucket counts differ".to_string(),
            });
        }

        let params = EnvelopeParams::from_sensitivity(raw_sensitivity, waveform.bucket_seconds);

        let magnitudes: Vec<f32> = waveform
            .maxs
            .iter()
            .zip(waveform.mins.iter())
            .map(|(hi, lo)| {
                let m = hi.abs().max(lo.abs());
                if m.is_finite() {
                    m
                } else {
                    0.0
                }
            })
            .collect();

        let peak_amplitude = magnitudes.iter().copied().fold(0.0_f32, f32::max);

        let mut values = Vec::with_capacity(magnitudes.len());
        for (i, m) in magnitudes.iter().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(DetectionError::Cancelled);
            }
            let normalized = if peak_amplitude > 0.0 {
                (m / peak_amplitude).clamp(0.0, 1.0)
            } else {
                0.0
            };
            values.push(normalized);
        }

        let threshold = adaptive_threshold(&values, params.window_buckets, params.boost, cancel)?;

        Ok(Envelope {
            values,
            threshold,
            peak_amplitude,
            params,
        })
    }
}

/// Centered moving average over `window` buckets plus `boost`, clamped to [0, 1]
fn adaptive_threshold(
    values: &[f32],
    window: usize,
    boost: f64,
    cancel: &dyn CancelCheck,
) -> Result<Vec<f32>, DetectionError> {
    let n = values.len();
    let half = window / 2;

    // Prefix sums keep the moving average O(n) for long tracks
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0_f64);
    for v in values {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + *v as f64);
    }

    let mut threshold = Vec::with_capacity(n);
    for i in 0..n {
        if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(DetectionError::Cancelled);
        }
        let start = i.saturating_sub(half);
        let end = (i + half + 1).min(n);
        let mean = (prefix[end] - prefix[start]) / (end - start) as f64;
        threshold.push((mean + boost).clamp(0.0, 1.0) as f32);
    }

    Ok(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::NeverCancel;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn waveform(maxs: Vec<f32>, bucket_seconds: f64) -> WaveformSummary {
        let mins = maxs.iter().map(|m| -m * 0.5).collect();
        let duration = maxs.len() as f64 * bucket_seconds;
        WaveformSummary::new(44100, bucket_seconds, mins, maxs, duration).unwrap()
    }

    #[test]
    fn test_window_buckets_clamped_for_all_sensitivities() {
        for bucket_seconds in [0.0001, 0.001, 0.01, 0.05, 0.5] {
            for raw in 0..=100 {
                let params = EnvelopeParams::from_sensitivity(raw as f64, bucket_seconds);
                assert!(
                    (4..=160).contains(&params.window_buckets),
                    "window {} out of range at sensitivity {} / bucket {}",
                    params.window_buckets,
                    raw,
                    bucket_seconds
                );
                assert!(params.min_separation_buckets >= 3);
            }
        }
    }

    #[test]
    fn test_sensitivity_normalization_bounds() {
        assert_eq!(normalize_sensitivity(0.0), 0.05);
        assert_eq!(normalize_sensitivity(-20.0), 0.05);
        assert_eq!(normalize_sensitivity(100.0), 1.0);
        assert_eq!(normalize_sensitivity(250.0), 1.0);
        assert!((normalize_sensitivity(60.0) - 0.6).abs() < 1e-12);
        assert_eq!(normalize_sensitivity(f64::NAN), 0.05);
    }

    #[test]
    fn test_parameters_at_full_sensitivity() {
        let params = EnvelopeParams::from_sensitivity(100.0, 0.01);
        assert!((params.window_seconds - 0.12).abs() < 1e-12);
        assert!((params.boost - 0.12).abs() < 1e-12);
        assert_eq!(params.window_buckets, 12);
        assert_eq!(params.min_separation_buckets, 8);
    }

    #[test]
    fn test_envelope_normalized_to_global_peak() {
        let wf = waveform(vec![0.1, 0.4, 0.2, 0.8], 0.01);
        let env = EnvelopeBuilder::build(&wf, 50.0, &NeverCancel).unwrap();

        assert_eq!(env.peak_amplitude, 0.8);
        assert_eq!(env.values[3], 1.0);
        assert!((env.values[1] - 0.5).abs() < 1e-6);
        assert!(env.values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_negative_extrema_count_as_magnitude() {
        let wf = WaveformSummary::new(44100, 0.01, vec![-0.9, -0.1], vec![0.2, 0.3], 0.02).unwrap();
        let env = EnvelopeBuilder::build(&wf, 50.0, &NeverCancel).unwrap();
        assert_eq!(env.values[0], 1.0);
    }

    #[test]
    fn test_silence_produces_zero_envelope() {
        let wf = waveform(vec![0.0; 32], 0.01);
        let env = EnvelopeBuilder::build(&wf, 50.0, &NeverCancel).unwrap();
        assert!(env.values.iter().all(|v| *v == 0.0));
        assert!(env.threshold.iter().all(|t| *t > 0.0));
    }

    #[test]
    fn test_threshold_is_moving_average_plus_boost() {
        let wf = waveform(vec![1.0; 20], 0.01);
        let env = EnvelopeBuilder::build(&wf, 100.0, &NeverCancel).unwrap();
        // Flat envelope of 1.0 plus any boost clamps to 1.0
        assert!(env.threshold.iter().all(|t| *t == 1.0));
    }

    #[test]
    fn test_invalid_bucket_duration_rejected() {
        let wf = WaveformSummary {
            sample_rate: 44100,
            bucket_seconds: 0.0,
            mins: vec![0.0],
            maxs: vec![1.0],
            duration_seconds: 0.0,
        };
        let err = EnvelopeBuilder::build(&wf, 50.0, &NeverCancel).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidWaveform { .. }));
    }

    struct FlagCancel(AtomicBool);

    impl CancelCheck for FlagCancel {
        fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_cancelled_build_returns_cancelled() {
        let wf = waveform(vec![0.5; 4096], 0.01);
        let cancel = FlagCancel(AtomicBool::new(true));
        let err = EnvelopeBuilder::build(&wf, 50.0, &cancel).unwrap_err();
        assert_eq!(err, DetectionError::Cancelled);
    }
}
