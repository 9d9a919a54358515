// Grid-snapping draft builder
//
// Maps each onset onto the primary quantization grid. Onsets outside the
// snap tolerance keep their detected time unless quantization is forced.
// Velocity comes from the onset amplitude relative to the loudest onset,
// bucketed against that onset's decay series.

use std::path::Path;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{Draft, DraftBuilder, DraftHit, DraftOptions, DraftOutcome, DraftTrack, ProgressCallback};
use crate::analysis::OnsetPeak;

const PROGRESS_CHUNK: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct SnapDraftBuilder;

impl SnapDraftBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the draft synchronously
    pub fn build(
        &self,
        track: &DraftTrack,
        options: &DraftOptions,
        progress: &dyn Fn(f32),
        cancel: &CancellationToken,
    ) -> DraftOutcome {
        let grid = &track.quantization.primary;
        if !grid.step_seconds.is_finite() || grid.step_seconds <= 0.0 {
            return DraftOutcome::failed(format!(
                "invalid grid step {} for {:.1} BPM",
                grid.step_seconds, grid.bpm
            ));
        }

        let loudest = track
            .peaks
            .iter()
            .max_by(|a, b| a.amplitude.total_cmp(&b.amplitude));

        let total = track.peaks.len().max(1);
        let mut hits = Vec::with_capacity(track.peaks.len());
        for (i, peak) in track.peaks.iter().enumerate() {
            if i % PROGRESS_CHUNK == 0 {
                if cancel.is_cancelled() {
                    return DraftOutcome::failed("draft generation cancelled");
                }
                progress(i as f32 / total as f32);
            }

            let snap_to_grid = options.force_quantization
                || grid.snap_error_ms(peak.time_seconds) <= options.max_snap_error_ms;
            let snapped_time = grid.snap(peak.time_seconds);
            hits.push(DraftHit {
                time_seconds: if snap_to_grid {
                    snapped_time
                } else {
                    peak.time_seconds
                },
                grid_index: ((snapped_time - grid.offset_seconds) / grid.step_seconds).round()
                    as i64,
                velocity: loudest.map_or(1, |loudest| velocity(peak, loudest)),
                snapped: snap_to_grid,
            });
        }
        progress(1.0);

        let downbeat_confidence = match options.downbeat_confidence_cap {
            Some(cap) => track.confidence.min(cap),
            None => track.confidence,
        };

        DraftOutcome::succeeded(Draft {
            title: track.title.clone(),
            bpm: grid.bpm,
            grid: options.grid,
            offset_seconds: grid.offset_seconds,
            step_seconds: grid.step_seconds,
            downbeat_confidence: downbeat_confidence.clamp(0.0, 1.0),
            hits,
        })
    }
}

/// Velocity bucket 1-4 for `peak` against the loudest onset's decay series
fn velocity(peak: &OnsetPeak, loudest: &OnsetPeak) -> u8 {
    let h = &loudest.harmonics;
    if peak.amplitude >= h[1] {
        4
    } else if peak.amplitude >= h[2] {
        3
    } else if peak.amplitude >= h[3] {
        2
    } else {
        1
    }
}

impl DraftBuilder for SnapDraftBuilder {
    fn generate<'a>(
        &'a self,
        track: &'a DraftTrack,
        options: &'a DraftOptions,
        progress: ProgressCallback,
        cancel: &'a CancellationToken,
        _drum_stem_path: Option<&'a Path>,
    ) -> BoxFuture<'a, DraftOutcome> {
        async move { self.build(track, options, progress.as_ref(), cancel) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::quantizer::{GridKind, QuantizationCandidate, QuantizationSummary};
    use std::path::PathBuf;

    fn peak(time_seconds: f64, amplitude: f32) -> OnsetPeak {
        OnsetPeak {
            time_seconds,
            confidence: 0.9,
            amplitude,
            threshold: 0.2,
            bucket_index: (time_seconds * 100.0) as usize,
            harmonics: [1.0, 0.75, 0.45, 0.25].map(|f| amplitude * f),
        }
    }

    fn track(peaks: Vec<OnsetPeak>) -> DraftTrack {
        let primary = QuantizationCandidate {
            bpm: 120.0,
            coverage: 1.0,
            mean_error_ms: 0.0,
            median_error_ms: 0.0,
            offset_seconds: 0.0,
            step_seconds: 0.125,
        };
        DraftTrack {
            title: "take".to_string(),
            audio_path: PathBuf::from("take.wav"),
            duration_seconds: 4.0,
            peaks,
            quantization: QuantizationSummary {
                grid: GridKind::Sixteenth,
                primary: primary.clone(),
                candidates: vec![primary],
                reference_bpm: 120.0,
            },
            confidence: 0.8,
        }
    }

    fn options(force: bool, cap: Option<f64>) -> DraftOptions {
        DraftOptions {
            grid: GridKind::Sixteenth,
            max_snap_error_ms: 20.0,
            force_quantization: force,
            downbeat_confidence_cap: cap,
        }
    }

    #[test]
    fn test_snaps_only_within_tolerance() {
        let track = track(vec![peak(0.51, 1.0), peak(1.06, 1.0)]);
        let outcome = SnapDraftBuilder::new().build(
            &track,
            &options(false, None),
            &|_| {},
            &CancellationToken::new(),
        );
        let draft = outcome.draft.unwrap();

        assert!(draft.hits[0].snapped);
        assert!((draft.hits[0].time_seconds - 0.5).abs() < 1e-9);
        assert_eq!(draft.hits[0].grid_index, 4);
        // 60 ms from the nearest line
        assert!(!draft.hits[1].snapped);
        assert_eq!(draft.hits[1].time_seconds, 1.06);
    }

    #[test]
    fn test_forced_quantization_snaps_everything() {
        let track = track(vec![peak(1.06, 1.0)]);
        let draft = SnapDraftBuilder::new()
            .build(&track, &options(true, None), &|_| {}, &CancellationToken::new())
            .draft
            .unwrap();
        assert!(draft.hits[0].snapped);
        assert!((draft.hits[0].time_seconds - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_velocity_buckets() {
        let track = track(vec![
            peak(0.0, 1.0),
            peak(0.5, 0.5),
            peak(1.0, 0.3),
            peak(1.5, 0.1),
        ]);
        let draft = SnapDraftBuilder::new()
            .build(&track, &options(false, None), &|_| {}, &CancellationToken::new())
            .draft
            .unwrap();
        let velocities: Vec<u8> = draft.hits.iter().map(|h| h.velocity).collect();
        assert_eq!(velocities, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_downbeat_confidence_capped() {
        let draft = SnapDraftBuilder::new()
            .build(
                &track(vec![peak(0.0, 1.0)]),
                &options(false, Some(0.5)),
                &|_| {},
                &CancellationToken::new(),
            )
            .draft
            .unwrap();
        assert_eq!(draft.downbeat_confidence, 0.5);
    }

    #[test]
    fn test_invalid_step_fails() {
        let mut track = track(vec![peak(0.0, 1.0)]);
        track.quantization.primary.step_seconds = 0.0;
        let outcome = SnapDraftBuilder::new().build(
            &track,
            &options(false, None),
            &|_| {},
            &CancellationToken::new(),
        );
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("invalid grid step"));
    }

    #[tokio::test]
    async fn test_generate_reports_completion() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let track = track(vec![peak(0.0, 1.0)]);
        let options = options(false, None);
        let outcome = SnapDraftBuilder::new()
            .generate(
                &track,
                &options,
                std::sync::Arc::new(move |p| sink.lock().unwrap().push(p)),
                &CancellationToken::new(),
                None,
            )
            .await;
        assert!(outcome.success);
        assert_eq!(seen.lock().unwrap().last().copied(), Some(1.0));
    }
}
