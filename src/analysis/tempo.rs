//! TempoEstimator - base BPM from inter-onset intervals
//!
//! Consecutive peak deltas inside the configured interval window are
//! collected, their median becomes the beat period, and the resulting BPM
//! is folded by octaves into the comfortable range before a final clamp.

use super::OnsetPeak;
use crate::config::DetectionConfig;

pub struct TempoEstimator {
    default_bpm: f64,
    fold_min: f64,
    fold_max: f64,
    clamp_min: f64,
    clamp_max: f64,
    min_interval: f64,
    max_interval: f64,
}

impl TempoEstimator {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            default_bpm: config.default_bpm,
            fold_min: config.fold_min_bpm,
            fold_max: config.fold_max_bpm,
            clamp_min: config.clamp_min_bpm,
            clamp_max: config.clamp_max_bpm,
            min_interval: config.min_interval_seconds,
            max_interval: config.max_interval_seconds,
        }
    }

    /// Estimate the base tempo of a peak sequence
    ///
    /// Returns the default tempo when fewer than two peaks exist or no
    /// interval falls inside the window.
    pub fn estimate(&self, peaks: &[OnsetPeak]) -> f64 {
        let times: Vec<f64> = peaks.iter().map(|p| p.time_seconds).collect();
        self.estimate_from_times(&times)
    }

    pub fn estimate_from_times(&self, times: &[f64]) -> f64 {
        let valid: Vec<f64> = times.iter().copied().filter(|t| t.is_finite()).collect();
        if valid.len() < 2 {
            return self.default_bpm;
        }

        let mut deltas: Vec<f64> = valid
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| *d >= self.min_interval && *d <= self.max_interval)
            .collect();

        if deltas.is_empty() {
            return self.default_bpm;
        }

        let period = match median(&mut deltas) {
            Some(m) if m.is_finite() && m > 0.0 => m,
            _ => deltas.iter().sum::<f64>() / deltas.len() as f64,
        };

        if !period.is_finite() || period <= 0.0 {
            return self.default_bpm;
        }

        self.fold(60.0 / period)
    }

    /// Fold a BPM by octaves into the fold range, then clamp
    pub fn fold(&self, bpm: f64) -> f64 {
        if !bpm.is_finite() || bpm <= 0.0 {
            return self.default_bpm;
        }

        let mut folded = bpm;
        // Bounded loop: the interval window keeps this to a handful of steps
        for _ in 0..16 {
            if folded < self.fold_min {
                folded *= 2.0;
            } else if folded > self.fold_max {
                folded /= 2.0;
            } else {
                break;
            }
        }

        folded.clamp(self.clamp_min, self.clamp_max)
    }
}

/// Median of a slice, sorting it in place
pub(crate) fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
