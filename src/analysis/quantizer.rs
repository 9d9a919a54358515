//! Quantizer - grid search and timing error analysis
//!
//! This module scores how well a set of onset times fits a rhythmic grid.
//! Key features:
//! - Grid step derived from BPM and subdivision (quarter → thirty-second)
//! - Offset search seeded from the first few onsets
//! - Coverage within a snap tolerance, plus mean/median snap error in ms
//!
//! The grid at offset `o` and step `d` is the set `{o + k·d}`; the snap error
//! of an onset is its distance to the nearest grid line.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Grid subdivision used for quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridKind {
    Quarter,
    Eighth,
    Sixteenth,
    Triplet,
    ThirtySecond,
}

impl GridKind {
    pub const ALL: [GridKind; 5] = [
        GridKind::Quarter,
        GridKind::Eighth,
        GridKind::Sixteenth,
        GridKind::Triplet,
        GridKind::ThirtySecond,
    ];

    /// Grid lines per beat
    pub fn divider(self) -> u32 {
        match self {
            GridKind::Quarter => 1,
            GridKind::Eighth => 2,
            GridKind::Triplet => 3,
            GridKind::Sixteenth => 4,
            GridKind::ThirtySecond => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GridKind::Quarter => "quarter",
            GridKind::Eighth => "eighth",
            GridKind::Sixteenth => "sixteenth",
            GridKind::Triplet => "triplet",
            GridKind::ThirtySecond => "thirty_second",
        }
    }
}

impl fmt::Display for GridKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GridKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        GridKind::ALL
            .iter()
            .copied()
            .find(|g| g.name() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown grid '{}' (expected quarter, eighth, sixteenth, triplet or thirty_second)",
                    s
                )
            })
    }
}

/// Grid step in seconds: `(60 / bpm) / divider`
pub fn step_seconds(grid: GridKind, bpm: f64) -> f64 {
    (60.0 / bpm) / grid.divider() as f64
}

/// Scored grid hypothesis for one BPM
///
/// Invariant: `step_seconds == step_seconds(grid, bpm)` for the grid it was
/// evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationCandidate {
    pub bpm: f64,
    /// Fraction of onsets within the snap tolerance (0.0-1.0)
    pub coverage: f64,
    pub mean_error_ms: f64,
    pub median_error_ms: f64,
    pub offset_seconds: f64,
    pub step_seconds: f64,
}

impl QuantizationCandidate {
    /// Candidate for a BPM with no onsets to score
    pub fn empty(bpm: f64, grid: GridKind) -> Self {
        Self {
            bpm,
            coverage: 0.0,
            mean_error_ms: 0.0,
            median_error_ms: 0.0,
            offset_seconds: 0.0,
            step_seconds: step_seconds(grid, bpm),
        }
    }

    /// Nearest grid time for `time`
    pub fn snap(&self, time: f64) -> f64 {
        snap_to_grid(time, self.offset_seconds, self.step_seconds)
    }

    /// Distance from `time` to its nearest grid line, in milliseconds
    pub fn snap_error_ms(&self, time: f64) -> f64 {
        (time - self.snap(time)).abs() * 1000.0
    }
}

/// Result of the grid search for one grid kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSummary {
    pub grid: GridKind,
    /// Selected candidate
    pub primary: QuantizationCandidate,
    /// All evaluated candidates, coverage descending then mean error ascending
    pub candidates: Vec<QuantizationCandidate>,
    /// Tempo the deviation penalty was measured against
    pub reference_bpm: f64,
}

impl QuantizationSummary {
    pub fn grid_name(&self) -> &'static str {
        self.grid.name()
    }
}

/// Order candidates by coverage descending, then mean error ascending
pub fn sort_candidates(candidates: &mut [QuantizationCandidate]) {
    candidates.sort_by(|a, b| {
        b.coverage
            .partial_cmp(&a.coverage)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.mean_error_ms
                    .partial_cmp(&b.mean_error_ms)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
}

/// Grid search over a fixed onset sequence
///
/// # Example
/// ```ignore
/// let search = QuantizationGridSearch::new(6);
/// let candidate = search.search(&times, 120.0, GridKind::Sixteenth, 35.0, None);
/// println!("coverage {:.0}%", candidate.coverage * 100.0);
/// ```
pub struct QuantizationGridSearch {
    offset_search_peaks: usize,
}

impl QuantizationGridSearch {
    /// # Arguments
    /// * `offset_search_peaks` - How many leading onsets seed the offset search
    pub fn new(offset_search_peaks: usize) -> Self {
        Self {
            offset_search_peaks: offset_search_peaks.max(1),
        }
    }

    /// Find the best offset (or use the forced one) and evaluate the grid
    ///
    /// Fewer than two onsets cannot define a grid and score zero coverage.
    pub fn search(
        &self,
        times: &[f64],
        bpm: f64,
        grid: GridKind,
        max_snap_error_ms: f64,
        forced_offset_seconds: Option<f64>,
    ) -> QuantizationCandidate {
        let step = step_seconds(grid, bpm);
        if times.len() < 2 || !step.is_finite() || step <= 0.0 {
            return QuantizationCandidate::empty(bpm, grid);
        }

        let offset = match forced_offset_seconds {
            Some(offset) if offset.is_finite() => offset.rem_euclid(step),
            _ => self.best_offset(times, step),
        };

        evaluate(times, bpm, step, offset, max_snap_error_ms)
    }

    /// Pick the offset that minimizes total snap distance
    ///
    /// Candidate offsets are `time mod step` of the first `min(offset_search_peaks, N)` onsets;
    /// ties keep the earliest seed.
    pub fn best_offset(&self, times: &[f64], step: f64) -> f64 {
        let mut best_offset = 0.0;
        let mut best_total = f64::INFINITY;

        for seed in times.iter().take(self.offset_search_peaks) {
            let offset = seed.rem_euclid(step);
            let total: f64 = times
                .iter()
                .map(|t| (t - snap_to_grid(*t, offset, step)).abs())
                .sum();
            if total < best_total {
                best_total = total;
                best_offset = offset;
            }
        }

        best_offset
    }
}

/// Score a fixed grid against the onsets
pub fn evaluate(
    times: &[f64],
    bpm: f64,
    step: f64,
    offset: f64,
    max_snap_error_ms: f64,
) -> QuantizationCandidate {
    if times.is_empty() {
        return QuantizationCandidate {
            bpm,
            coverage: 0.0,
            mean_error_ms: 0.0,
            median_error_ms: 0.0,
            offset_seconds: offset,
            step_seconds: step,
        };
    }

    let mut errors: Vec<f64> = times
        .iter()
        .map(|t| (t - snap_to_grid(*t, offset, step)).abs() * 1000.0)
        .collect();

    // Small epsilon so an onset sitting exactly on the tolerance still counts
    let within = errors
        .iter()
        .filter(|e| **e <= max_snap_error_ms + 1e-9)
        .count();
    let mean_error_ms = errors.iter().sum::<f64>() / errors.len() as f64;
    let median_error_ms = super::tempo::median(&mut errors).unwrap_or(mean_error_ms);

    QuantizationCandidate {
        bpm,
        coverage: within as f64 / times.len() as f64,
        mean_error_ms,
        median_error_ms,
        offset_seconds: offset,
        step_seconds: step,
    }
}

fn snap_to_grid(time: f64, offset: f64, step: f64) -> f64 {
    offset + ((time - offset) / step).round() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat_times(bpm: f64, count: usize, offset: f64) -> Vec<f64> {
        let period = 60.0 / bpm;
        (0..count).map(|i| offset + i as f64 * period).collect()
    }

    #[test]
    fn test_grid_dividers() {
        assert_eq!(GridKind::Quarter.divider(), 1);
        assert_eq!(GridKind::Eighth.divider(), 2);
        assert_eq!(GridKind::Sixteenth.divider(), 4);
        assert_eq!(GridKind::Triplet.divider(), 3);
        assert_eq!(GridKind::ThirtySecond.divider(), 8);
    }

    #[test]
    fn test_step_seconds() {
        assert!((step_seconds(GridKind::Quarter, 120.0) - 0.5).abs() < 1e-12);
        assert!((step_seconds(GridKind::Sixteenth, 120.0) - 0.125).abs() < 1e-12);
        assert!((step_seconds(GridKind::Triplet, 60.0) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_grid_kind_parse_and_serde() {
        assert_eq!("sixteenth".parse::<GridKind>().unwrap(), GridKind::Sixteenth);
        assert_eq!("Thirty-Second".parse::<GridKind>().unwrap(), GridKind::ThirtySecond);
        assert!("dotted".parse::<GridKind>().is_err());

        let json = serde_json::to_string(&GridKind::ThirtySecond).unwrap();
        assert_eq!(json, "\"thirty_second\"");
    }

    #[test]
    fn test_perfect_grid_full_coverage() {
        let times = beat_times(120.0, 16, 0.3);
        let candidate = QuantizationGridSearch::new(6).search(
            &times,
            120.0,
            GridKind::Quarter,
            35.0,
            None,
        );

        assert_eq!(candidate.coverage, 1.0);
        assert!(candidate.mean_error_ms < 1e-6);
        assert!((candidate.offset_seconds - 0.3).abs() < 1e-9);
        assert!((candidate.step_seconds - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_offset_search_ignores_outlier_seed() {
        // First onset is 60 ms early; later seeds find the true phase
        let mut times = beat_times(120.0, 12, 0.2);
        times[0] -= 0.06;
        let search = QuantizationGridSearch::new(6);
        let offset = search.best_offset(&times, 0.5);
        assert!((offset - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_counts_within_tolerance_only() {
        // Errors of 0, 10, 40, 0 ms against a 0.5 s grid
        let times = vec![0.0, 0.51, 1.04, 1.5];
        let candidate = evaluate(&times, 120.0, 0.5, 0.0, 35.0);
        assert_eq!(candidate.coverage, 0.75);
        assert!((candidate.mean_error_ms - 12.5).abs() < 1e-6);
        assert!((candidate.median_error_ms - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_forced_offset_skips_search() {
        let times = beat_times(120.0, 8, 0.25);
        let candidate = QuantizationGridSearch::new(6).search(
            &times,
            120.0,
            GridKind::Quarter,
            35.0,
            Some(0.0),
        );
        assert_eq!(candidate.offset_seconds, 0.0);
        // Every onset is a quarter step off the grid
        assert_eq!(candidate.coverage, 0.0);
        assert!((candidate.mean_error_ms - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_or_one_onset_zero_coverage() {
        let search = QuantizationGridSearch::new(6);
        let candidate = search.search(&[], 120.0, GridKind::Sixteenth, 35.0, None);
        assert_eq!(candidate.coverage, 0.0);
        assert!((candidate.step_seconds - 0.125).abs() < 1e-12);

        let candidate = search.search(&[1.0], 120.0, GridKind::Sixteenth, 35.0, None);
        assert_eq!(candidate.coverage, 0.0);
    }

    #[test]
    fn test_sort_candidates_order() {
        let mk = |bpm: f64, coverage: f64, mean: f64| QuantizationCandidate {
            bpm,
            coverage,
            mean_error_ms: mean,
            median_error_ms: mean,
            offset_seconds: 0.0,
            step_seconds: 60.0 / bpm,
        };
        let mut list = vec![mk(60.0, 0.5, 3.0), mk(120.0, 0.9, 8.0), mk(240.0, 0.9, 2.0)];
        sort_candidates(&mut list);

        let bpms: Vec<f64> = list.iter().map(|c| c.bpm).collect();
        assert_eq!(bpms, vec![240.0, 120.0, 60.0]);
    }

    #[test]
    fn test_candidate_snap() {
        let candidate = evaluate(&[0.0], 120.0, 0.125, 0.0, 35.0);
        assert!((candidate.snap(0.13) - 0.125).abs() < 1e-12);
        assert!((candidate.snap_error_ms(0.13) - 5.0).abs() < 1e-6);
    }
}
