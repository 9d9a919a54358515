//! Backend contracts for the external collaborators of a run.
//!
//! The orchestrator only talks to these traits: a separation backend that
//! isolates drums, a PCM decoder that summarises audio into a waveform, and
//! a draft builder that maps the analysis onto a rhythmic draft. Async
//! methods return boxed futures so backends can be swapped at runtime as
//! `Arc<dyn Trait>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::analysis::quantizer::{GridKind, QuantizationSummary};
use crate::analysis::{OnsetPeak, WaveformSummary};
use crate::error::BackendError;

mod passthrough;
mod snap;
mod wav;

pub use passthrough::PassthroughSeparation;
pub use snap::SnapDraftBuilder;
pub use wav::WavDecoder;

/// Local progress callback (0.0-1.0) handed to backends
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Result of a capability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeparationCapability {
    Available,
    Unavailable { reason: String },
}

impl SeparationCapability {
    pub fn is_available(&self) -> bool {
        matches!(self, SeparationCapability::Available)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationOutput {
    pub drums_path: PathBuf,
    /// True when the original mix was returned unmodified
    pub is_passthrough: bool,
}

/// Drum isolation backend
pub trait SeparationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap check run before a backend is selected
    fn probe(&self) -> SeparationCapability;

    fn load_model<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), BackendError>>;

    fn separate<'a>(
        &'a self,
        audio_path: &'a Path,
        cancel: &'a CancellationToken,
        progress: ProgressCallback,
    ) -> BoxFuture<'a, Result<SeparationOutput, BackendError>>;
}

/// Backend chosen for a run, and why the preferred one was skipped
pub struct BackendSelection {
    pub backend: Arc<dyn SeparationBackend>,
    pub fallback_reason: Option<String>,
}

/// Pick `preferred` when its probe succeeds, otherwise `fallback`
pub fn select_separation_backend(
    preferred: Arc<dyn SeparationBackend>,
    fallback: Arc<dyn SeparationBackend>,
) -> BackendSelection {
    match preferred.probe() {
        SeparationCapability::Available => BackendSelection {
            backend: preferred,
            fallback_reason: None,
        },
        SeparationCapability::Unavailable { reason } => BackendSelection {
            backend: fallback,
            fallback_reason: Some(format!(
                "Separation backend '{}' unavailable ({}); using {}",
                preferred.name(),
                reason,
                "passthrough audio"
            )),
        },
    }
}

/// Decoder output
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub waveform: WaveformSummary,
}

/// Audio decoder producing a bucketed waveform summary
pub trait PcmDecoder: Send + Sync {
    /// Whether the playback/decoding device is ready; when false the run
    /// continues with offline decoding and a warning
    fn is_ready(&self) -> bool;

    fn decode<'a>(
        &'a self,
        path: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<DecodedAudio, BackendError>>;
}

/// Analysis handed to the draft builder
#[derive(Debug, Clone, PartialEq)]
pub struct DraftTrack {
    pub title: String,
    pub audio_path: PathBuf,
    pub duration_seconds: f64,
    pub peaks: Vec<OnsetPeak>,
    pub quantization: QuantizationSummary,
    /// Detection confidence (0.0-1.0)
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftOptions {
    pub grid: GridKind,
    pub max_snap_error_ms: f64,
    /// Snap every onset, even those outside the snap tolerance
    pub force_quantization: bool,
    /// Upper bound for downbeat confidence on low-confidence runs
    pub downbeat_confidence_cap: Option<f64>,
}

/// One note of the draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftHit {
    pub time_seconds: f64,
    pub grid_index: i64,
    /// 1 (ghost) to 4 (accent)
    pub velocity: u8,
    /// Whether the hit was moved onto the grid
    pub snapped: bool,
}

/// Rhythmic draft produced by a builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub title: String,
    pub bpm: f64,
    pub grid: GridKind,
    pub offset_seconds: f64,
    pub step_seconds: f64,
    pub downbeat_confidence: f64,
    pub hits: Vec<DraftHit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftOutcome {
    pub success: bool,
    pub draft: Option<Draft>,
    pub error: Option<String>,
}

impl DraftOutcome {
    pub fn succeeded(draft: Draft) -> Self {
        Self {
            success: true,
            draft: Some(draft),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            draft: None,
            error: Some(error.into()),
        }
    }
}

/// Maps the analysis onto a draft
pub trait DraftBuilder: Send + Sync {
    fn generate<'a>(
        &'a self,
        track: &'a DraftTrack,
        options: &'a DraftOptions,
        progress: ProgressCallback,
        cancel: &'a CancellationToken,
        drum_stem_path: Option<&'a Path>,
    ) -> BoxFuture<'a, DraftOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct Offline;

    impl SeparationBackend for Offline {
        fn name(&self) -> &str {
            "stem-model"
        }

        fn probe(&self) -> SeparationCapability {
            SeparationCapability::Unavailable {
                reason: "model weights missing".to_string(),
            }
        }

        fn load_model<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), BackendError>> {
            async { Ok(()) }.boxed()
        }

        fn separate<'a>(
            &'a self,
            audio_path: &'a Path,
            _cancel: &'a CancellationToken,
            _progress: ProgressCallback,
        ) -> BoxFuture<'a, Result<SeparationOutput, BackendError>> {
            async move {
                Ok(SeparationOutput {
                    drums_path: audio_path.to_path_buf(),
                    is_passthrough: false,
                })
            }
            .boxed()
        }
    }

    #[test]
    fn test_probe_failure_selects_fallback() {
        let selection = select_separation_backend(
            Arc::new(Offline),
            Arc::new(PassthroughSeparation::new()),
        );
        assert_eq!(selection.backend.name(), "passthrough");
        let reason = selection.fallback_reason.unwrap();
        assert!(reason.contains("stem-model"));
        assert!(reason.contains("model weights missing"));
    }

    #[test]
    fn test_available_backend_selected() {
        let selection = select_separation_backend(
            Arc::new(PassthroughSeparation::new()),
            Arc::new(PassthroughSeparation::new()),
        );
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn test_draft_outcome_constructors() {
        let failed = DraftOutcome::failed("no onsets");
        assert!(!failed.success);
        assert!(failed.draft.is_none());
        assert_eq!(failed.error.as_deref(), Some("no onsets"));
    }
}
