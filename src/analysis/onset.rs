// PeakDetector - envelope peak picking with minimum separation
//
// A bucket i (1..n-2) is accepted as an onset when:
// 1. envelope[i] > envelope[i-1]            (rising edge)
// 2. envelope[i] >= envelope[i+1]           (local maximum, plateaus keep the first bucket)
// 3. envelope[i] > threshold[i]             (adaptive threshold)
// 4. i - last_accepted >= min_separation    (no double triggers on one hit)

use super::envelope::Envelope;
use super::{CancelCheck, OnsetPeak, CANCEL_CHECK_INTERVAL};
use crate::error::DetectionError;

/// Decay profile stored with each peak for downstream velocity bucketing
const HARMONIC_DECAY: [f32; 4] = [1.0, 0.75, 0.45, 0.25];

/// Confidence floor for a peak that only just clears the threshold
const BASE_CONFIDENCE: f32 = 0.35;

/// PeakDetector picks local maxima from a normalized envelope
pub struct PeakDetector {
    min_separation_buckets: usize,
}

impl PeakDetector {
    /// Create a detector enforcing the given minimum peak spacing
    pub fn new(min_separation_buckets: usize) -> Self {
        Self {
            min_separation_buckets: min_separation_buckets.max(1),
        }
    }

    /// Detect onsets in the envelope
    ///
    /// # Arguments
    /// * `envelope` - Normalized envelope and threshold
    /// * `bucket_seconds` - Duration of one bucket, used for peak timestamps
    /// * `cancel` - Checked periodically inside the scan
    ///
    /// # Returns
    /// Peaks ordered by time
    pub fn detect(
        &self,
        envelope: &Envelope,
        bucket_seconds: f64,
        cancel: &dyn CancelCheck,
    ) -> Result<Vec<OnsetPeak>, DetectionError> {
        let mut peaks = Vec::new();
        let values = &envelope.values;

        if values.len() < 3 {
            return Ok(peaks);
        }

        let mut last_accepted: Option<usize> = None;

        for i in 1..values.len() - 1 {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(DetectionError::Cancelled);
            }

            let prev = values[i - 1];
            let curr = values[i];
            let next = values[i + 1];
            let threshold = envelope.threshold[i];

            if !(curr > prev && curr >= next && curr > threshold) {
                continue;
            }

            if let Some(last) = last_accepted {
                if i - last < self.min_separation_buckets {
                    continue;
                }
            }

            last_accepted = Some(i);
            peaks.push(self.build_peak(envelope, i, bucket_seconds));
        }

        Ok(peaks)
    }

    fn build_peak(&self, envelope: &Envelope, index: usize, bucket_seconds: f64) -> OnsetPeak {
        let value = envelope.values[index];
        let threshold = envelope.threshold[index];
        let amplitude = value * envelope.peak_amplitude;

        OnsetPeak {
            time_seconds: index as f64 * bucket_seconds,
            confidence: peak_confidence(value, threshold),
            amplitude,
            threshold,
            bucket_index: index,
            harmonics: HARMONIC_DECAY.map(|factor| amplitude * factor),
        }
    }
}

/// Map how far a peak clears its threshold onto [0, 1]
///
/// A peak at the threshold scores `BASE_CONFIDENCE`; a peak at full scale
/// scores 1.0.
fn peak_confidence(value: f32, threshold: f32) -> f32 {
    let headroom = (1.0 - threshold).max(1e-3);
    let margin = ((value - threshold) / headroom).clamp(0.0, 1.0);
    (BASE_CONFIDENCE + (1.0 - BASE_CONFIDENCE) * margin).clamp(0.0, 1.0)
}
