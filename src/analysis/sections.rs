//! SectionProfiler - onset density per time section (diagnostics only)

use serde::{Deserialize, Serialize};

use super::OnsetPeak;

const MIN_SECTION_SECONDS: f64 = 5.0;
const MAX_SECTION_SECONDS: f64 = 20.0;
const TARGET_SECTION_COUNT: f64 = 12.0;

/// Fixed-length slice of the track with its onset density
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub onset_count: usize,
    /// Onsets per second over the nominal section length
    pub density: f64,
}

pub struct SectionProfiler;

impl SectionProfiler {
    /// Section length for a track: duration / 12, clamped to [5, 20] s
    pub fn section_length(duration_seconds: f64) -> f64 {
        (duration_seconds / TARGET_SECTION_COUNT).clamp(MIN_SECTION_SECONDS, MAX_SECTION_SECONDS)
    }

    /// Bucket peaks into sections covering the whole track
    pub fn profile(peaks: &[OnsetPeak], duration_seconds: f64) -> Vec<Section> {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Vec::new();
        }

        let length = Self::section_length(duration_seconds);
        let count = ((duration_seconds / length).ceil() as usize).max(1);

        let mut counts = vec![0usize; count];
        for peak in peaks {
            if !peak.time_seconds.is_finite() || peak.time_seconds < 0.0 {
                continue;
            }
            let index = ((peak.time_seconds / length) as usize).min(count - 1);
            counts[index] += 1;
        }

        counts
            .into_iter()
            .enumerate()
            .map(|(index, onset_count)| {
                let start_seconds = index as f64 * length;
                Section {
                    index,
                    start_seconds,
                    end_seconds: (start_seconds + length).min(duration_seconds),
                    onset_count,
                    density: onset_count as f64 / length,
                }
            })
            .collect()
    }
}
