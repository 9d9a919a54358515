// TempoCandidateSelector - BPM alias authority
//
// Builds tempo hypotheses from the base estimate (×1, ×2, ×0.5, ×1.5),
// grid-searches each, scores them and picks the primary grid. The selector
// is the only place that decides between octave aliases:
//
//   score = coverage + bonus - meanPenalty - medianPenalty - deviationPenalty
//
//   bonus            decisive_bonus if within tie_epsilon of the best coverage
//                    and ahead of every other candidate by decisive_lead,
//                    tie_bonus if only within tie_epsilon, else 0
//   meanPenalty      clamp(mean_ms / 18, 0, 0.35)
//   medianPenalty    clamp(median_ms / 16, 0, 0.2)
//   deviationPenalty min(|log2(bpm / reference)|, 2.0) * 0.08

use serde::{Deserialize, Serialize};

use super::quantizer::{
    sort_candidates, GridKind, QuantizationCandidate, QuantizationGridSearch, QuantizationSummary,
};
use crate::config::{DetectionConfig, ScoringConfig};

/// Inputs for one selection pass
#[derive(Debug, Clone)]
pub struct CandidateRequest {
    pub peak_times: Vec<f64>,
    pub base_bpm: f64,
    pub grid: GridKind,
    pub max_snap_error_ms: f64,
    pub forced_bpm: Option<f64>,
    pub forced_offset_seconds: Option<f64>,
    pub forced_step_seconds: Option<f64>,
}

/// Score assigned to one candidate during selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub bpm: f64,
    pub score: f64,
}

/// Competing octave alias of the primary tempo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctaveAmbiguity {
    pub primary_bpm: f64,
    pub primary_coverage: f64,
    pub alias_bpm: f64,
    pub alias_coverage: f64,
}

impl OctaveAmbiguity {
    pub fn message(&self) -> String {
        format!(
            "Tempo is ambiguous: {:.1} BPM and {:.1} BPM fit the onsets comparably (coverage {:.0}% vs {:.0}%)",
            self.primary_bpm,
            self.alias_bpm,
            self.primary_coverage * 100.0,
            self.alias_coverage * 100.0
        )
    }
}

/// Outcome of a selection pass
#[derive(Debug, Clone)]
pub struct TempoSelection {
    pub summary: QuantizationSummary,
    pub scores: Vec<CandidateScore>,
    pub ambiguity: Option<String>,
}

pub struct TempoCandidateSelector {
    scoring: ScoringConfig,
    detection: DetectionConfig,
}

impl TempoCandidateSelector {
    pub fn new(scoring: &ScoringConfig, detection: &DetectionConfig) -> Self {
        Self {
            scoring: scoring.clone(),
            detection: detection.clone(),
        }
    }

    /// Run the full candidate search and pick a primary grid
    pub fn select(&self, request: &CandidateRequest) -> TempoSelection {
        let forced = self.forced_bpm(request);
        let reference_bpm = forced.unwrap_or(request.base_bpm);

        let bpms = match forced {
            Some(bpm) => vec![bpm],
            None => self.collapse_aliases(&self.candidate_bpms(request.base_bpm)),
        };

        let search = QuantizationGridSearch::new(self.detection.offset_search_peaks);
        let evaluated: Vec<QuantizationCandidate> = bpms
            .iter()
            .map(|bpm| {
                search.search(
                    &request.peak_times,
                    *bpm,
                    request.grid,
                    request.max_snap_error_ms,
                    request.forced_offset_seconds,
                )
            })
            .collect();

        let scores = self.score_all(&evaluated, reference_bpm);

        let mut primary_index = 0;
        for (i, s) in scores.iter().enumerate() {
            if s.score > scores[primary_index].score {
                primary_index = i;
            }
        }

        let primary = evaluated
            .get(primary_index)
            .cloned()
            .unwrap_or_else(|| QuantizationCandidate::empty(reference_bpm, request.grid));

        let ambiguity = self
            .octave_ambiguity(&primary, &evaluated)
            .map(|a| a.message());

        let mut candidates = evaluated;
        sort_candidates(&mut candidates);

        tracing::debug!(
            primary_bpm = primary.bpm,
            coverage = primary.coverage,
            candidates = candidates.len(),
            ambiguous = ambiguity.is_some(),
            "tempo candidate selected"
        );

        TempoSelection {
            summary: QuantizationSummary {
                grid: request.grid,
                primary,
                candidates,
                reference_bpm,
            },
            scores,
            ambiguity,
        }
    }

    /// Forced tempo from an explicit BPM or an explicit grid step
    fn forced_bpm(&self, request: &CandidateRequest) -> Option<f64> {
        if let Some(bpm) = request.forced_bpm.filter(|b| b.is_finite() && *b > 0.0) {
            return Some(bpm);
        }
        request
            .forced_step_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(|step| 60.0 / (step * request.grid.divider() as f64))
    }

    /// ×1, ×2 (if ≤ max), ×0.5 (if ≥ min), clamp(×1.5)
    pub fn candidate_bpms(&self, base_bpm: f64) -> Vec<f64> {
        let min = self.detection.clamp_min_bpm;
        let max = self.detection.clamp_max_bpm;

        let mut bpms = vec![base_bpm];
        if base_bpm * 2.0 <= max {
            bpms.push(base_bpm * 2.0);
        }
        if base_bpm * 0.5 >= min {
            bpms.push(base_bpm * 0.5);
        }
        bpms.push((base_bpm * 1.5).clamp(min, max));
        bpms
    }

    /// Drop candidates within the alias tolerance of an earlier one
    pub fn collapse_aliases(&self, bpms: &[f64]) -> Vec<f64> {
        let tolerance = self.scoring.alias_tolerance_bpm;
        let mut kept: Vec<f64> = Vec::with_capacity(bpms.len());
        for bpm in bpms {
            if !bpm.is_finite() || *bpm <= 0.0 {
                continue;
            }
            if kept.iter().all(|k| (k - bpm).abs() > tolerance) {
                kept.push(*bpm);
            }
        }
        kept
    }

    fn score_all(&self, candidates: &[QuantizationCandidate], reference_bpm: f64) -> Vec<CandidateScore> {
        let best_coverage = candidates
            .iter()
            .map(|c| c.coverage)
            .fold(0.0_f64, f64::max);

        candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let best_other = candidates
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, o)| o.coverage)
                    .fold(f64::NEG_INFINITY, f64::max);
                CandidateScore {
                    bpm: c.bpm,
                    score: self.score(c, best_coverage, best_other, reference_bpm),
                }
            })
            .collect()
    }

    /// Score one candidate given the best coverage overall and among the others
    pub fn score(
        &self,
        candidate: &QuantizationCandidate,
        best_coverage: f64,
        best_other_coverage: f64,
        reference_bpm: f64,
    ) -> f64 {
        let s = &self.scoring;

        let bonus = if best_coverage - candidate.coverage <= s.tie_epsilon + 1e-9 {
            if candidate.coverage - best_other_coverage >= s.decisive_lead - 1e-9 {
                s.decisive_bonus
            } else {
                s.tie_bonus
            }
        } else {
            0.0
        };

        let mean_penalty = (candidate.mean_error_ms / s.mean_error_scale_ms)
            .clamp(0.0, s.mean_error_penalty_cap);
        let median_penalty = (candidate.median_error_ms / s.median_error_scale_ms)
            .clamp(0.0, s.median_error_penalty_cap);

        let deviation = if reference_bpm > 0.0 && candidate.bpm > 0.0 {
            (candidate.bpm / reference_bpm).log2().abs().min(s.octave_penalty_cap)
        } else {
            s.octave_penalty_cap
        };

        candidate.coverage + bonus - mean_penalty - median_penalty - deviation * s.octave_penalty
    }

    /// Best ×2 / ×0.5 alias of the primary whose coverage is within the margin
    pub fn octave_ambiguity(
        &self,
        primary: &QuantizationCandidate,
        candidates: &[QuantizationCandidate],
    ) -> Option<OctaveAmbiguity> {
        let alias = candidates
            .iter()
            .filter(|c| is_octave_of(c.bpm, primary.bpm))
            .max_by(|a, b| {
                a.coverage
                    .partial_cmp(&b.coverage)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;

        if alias.coverage <= 0.0 {
            return None;
        }
        if (primary.coverage - alias.coverage).abs() > self.scoring.decisive_lead + 1e-9 {
            return None;
        }

        Some(OctaveAmbiguity {
            primary_bpm: primary.bpm,
            primary_coverage: primary.coverage,
            alias_bpm: alias.bpm,
            alias_coverage: alias.coverage,
        })
    }
}

/// `candidate` is double or half of `primary` within 1%
fn is_octave_of(candidate: f64, primary: f64) -> bool {
    if primary <= 0.0 || candidate <= 0.0 {
        return false;
    }
    let ratio = candidate / primary;
    (ratio - 2.0).abs() <= 0.02 || (ratio - 0.5).abs() <= 0.005
}
