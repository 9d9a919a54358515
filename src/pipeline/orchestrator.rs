// PipelineOrchestrator - sequences the stages of one drafting run
//
// Stages run one after another on the run's worker task:
//   AudioInit → ModelLoad → Separation → DecodePcm → OnsetDetection
//   → TempoGrid → DraftMapping → Finalise
//
// Every external await races the run's cancellation token, and the token is
// checked again at each stage boundary. A panicking stage is caught here and
// faults the run with its partial state intact. Whatever happens, `run`
// returns one PipelineResult and publishes exactly one terminal event.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::heartbeat::HeartbeatEmitter;
use super::options::PipelineRequest;
use super::progress::ProgressPublisher;
use super::result::{LogLevel, PipelineOutcome, PipelineResult, RunState, SeparationReport};
use super::stage::{ProgressWeighting, StageId};
use crate::analysis::{DetectionStats, OnsetAnalyzer};
use crate::config::AppConfig;
use crate::engine::backend::{
    select_separation_backend, DraftBuilder, DraftOptions, DraftTrack, PassthroughSeparation,
    PcmDecoder, ProgressCallback, SeparationBackend, SeparationOutput, SnapDraftBuilder,
    WavDecoder,
};
use crate::error::{log_pipeline_error, BackendError, ErrorCode, PipelineError};
use crate::telemetry::{self, MetricEvent};

/// External collaborators used by a run
#[derive(Clone)]
pub struct PipelineBackends {
    /// Preferred drum separation backend
    pub separation: Arc<dyn SeparationBackend>,
    /// Used when the preferred backend is unavailable or fails
    pub fallback: Arc<dyn SeparationBackend>,
    pub decoder: Arc<dyn PcmDecoder>,
    pub builder: Arc<dyn DraftBuilder>,
}

impl PipelineBackends {
    /// Built-in backends: passthrough separation, WAV decoding, grid snapping
    pub fn offline(config: &AppConfig) -> Self {
        Self {
            separation: Arc::new(PassthroughSeparation::new()),
            fallback: Arc::new(PassthroughSeparation::new()),
            decoder: Arc::new(WavDecoder::new(config.detection.bucket_seconds)),
            builder: Arc::new(SnapDraftBuilder::new()),
        }
    }
}

pub struct PipelineOrchestrator {
    config: AppConfig,
    weighting: ProgressWeighting,
    backends: PipelineBackends,
    analyzer: OnsetAnalyzer,
}

impl PipelineOrchestrator {
    pub fn new(config: AppConfig, backends: PipelineBackends) -> Self {
        Self {
            analyzer: OnsetAnalyzer::new(config.clone()),
            weighting: ProgressWeighting::default(),
            config,
            backends,
        }
    }

    pub fn with_weighting(mut self, weighting: ProgressWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn weighting(&self) -> &ProgressWeighting {
        &self.weighting
    }

    /// Run every stage and publish the terminal event
    pub async fn run(
        &self,
        run_id: u64,
        request: PipelineRequest,
        cancel: CancellationToken,
        publisher: Arc<ProgressPublisher>,
    ) -> PipelineResult {
        let mut state = RunState::new(run_id);
        state.log(
            LogLevel::Info,
            None,
            format!("Run started for {}", request.audio_path.display()),
        );

        let heartbeat = HeartbeatEmitter::spawn(
            publisher.clone(),
            Duration::from_millis(self.config.pipeline.heartbeat_interval_ms),
        );

        let executed = AssertUnwindSafe(self.execute(&request, &cancel, &publisher, &mut state))
            .catch_unwind()
            .await;
        let executed = executed.unwrap_or_else(|payload| {
            let stage = state.active_stage().unwrap_or(StageId::AudioInit);
            Err(PipelineError::StageFailed {
                stage,
                reason: format!("stage panicked: {}", panic_message(payload.as_ref())),
            })
        });

        let outcome = match executed {
            Ok(()) => PipelineOutcome::Success,
            Err(err) if cancel.is_cancelled() || err.is_cancellation() => {
                let stage = state.active_stage();
                state.log(LogLevel::Info, stage, "Run cancelled");
                PipelineOutcome::Cancelled
            }
            Err(err) => {
                let context = state.active_stage().map(StageId::label).unwrap_or("run");
                log_pipeline_error(&err, context);
                state.record_metric(MetricEvent::error(&err, context));
                let stage = state.active_stage();
                state.log(LogLevel::Error, stage, err.message());
                PipelineOutcome::Failure {
                    reason: err.message(),
                }
            }
        };

        heartbeat.stop().await;

        if let Some((stage, elapsed_ms)) = state.end_active_stage() {
            state.record_metric(MetricEvent::StageCompleted {
                run_id,
                stage,
                elapsed_ms,
            });
        }
        let mut result = state.into_result(outcome);

        tracing::info!(
            run_id,
            state = ?result.final_state,
            total_ms = result.total_duration_ms,
            warnings = result.warnings.len(),
            "run finished"
        );
        let finished =
            MetricEvent::run_finished(run_id, result.final_state, result.total_duration_ms);
        telemetry::hub().record(finished.clone());
        result.telemetry.push(finished);

        publisher.publish_terminal(result.clone());
        result
    }

    async fn execute(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
        publisher: &Arc<ProgressPublisher>,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let options = &request.options;

        // AudioInit
        self.enter(StageId::AudioInit, "Preparing audio", cancel, publisher, state)?;
        if !self.backends.decoder.is_ready() {
            state.warn(
                Some(StageId::AudioInit),
                "Audio device not ready; decoding offline",
            );
        }
        self.finish("Audio ready", publisher, state);

        // ModelLoad + Separation
        let separation = if options.enable_separation {
            self.separate(request, cancel, publisher, state).await?
        } else {
            state.log(
                LogLevel::Info,
                None,
                "Separation disabled; analysing the original mix",
            );
            SeparationReport {
                backend: self.backends.fallback.name().to_string(),
                is_passthrough: true,
                drums_path: request.audio_path.clone(),
                fallback_reason: None,
            }
        };
        let drums_path = separation.drums_path.clone();
        let drum_stem = (!separation.is_passthrough).then(|| drums_path.clone());
        state.separation = Some(separation);

        // DecodePcm
        self.enter(StageId::DecodePcm, "Decoding audio", cancel, publisher, state)?;
        let decoded = race(cancel, self.backends.decoder.decode(&drums_path, cancel)).await??;
        let duration = decoded.waveform.duration_seconds;
        state.waveform = Some(decoded.waveform.clone());
        self.finish(
            format!("Decoded {:.1}s at {} Hz", duration, decoded.sample_rate),
            publisher,
            state,
        );

        // OnsetDetection
        self.enter(StageId::OnsetDetection, "Detecting onsets", cancel, publisher, state)?;
        let detection = {
            let analyzer = self.analyzer.clone();
            let waveform = decoded.waveform;
            let sensitivity = options.detection_sensitivity;
            let token = cancel.clone();
            let progress = publisher.clone();
            let task = tokio::task::spawn_blocking(move || {
                analyzer.detect_onsets(&waveform, sensitivity, &token, &mut |local| {
                    progress.progress(StageId::OnsetDetection, local);
                })
            });
            match task.await {
                Ok(result) => result?,
                Err(err) => {
                    let reason = if err.is_panic() {
                        format!("stage panicked: {}", panic_message(err.into_panic().as_ref()))
                    } else {
                        format!("detection task failed: {}", err)
                    };
                    return Err(PipelineError::StageFailed {
                        stage: StageId::OnsetDetection,
                        reason,
                    });
                }
            }
        };
        self.finish(
            format!("Detected {} onsets", detection.peaks.len()),
            publisher,
            state,
        );

        // TempoGrid
        self.enter(StageId::TempoGrid, "Resolving tempo grid", cancel, publisher, state)?;
        let stats = self.analyzer.quantize(&detection, &options.quantize_options());
        let mut force_quantization = options.force_quantization;
        let mut downbeat_cap = None;
        if stats.confidence.is_low {
            state.record_metric(MetricEvent::LowConfidence {
                run_id: state.run_id(),
                score: stats.confidence.score,
                threshold: stats.confidence.threshold,
            });
            if force_quantization && !stats.confidence.allows_forced_quantization() {
                force_quantization = false;
                state.log(
                    LogLevel::Info,
                    Some(StageId::TempoGrid),
                    "Forced quantization disabled for low confidence",
                );
            }
            downbeat_cap = stats.confidence.downbeat_cap;
        }
        for warning in stats.warnings() {
            state.warn(Some(StageId::TempoGrid), warning);
        }
        let status = grid_status(&stats);
        let track = DraftTrack {
            title: request.display_title(),
            audio_path: request.audio_path.clone(),
            duration_seconds: stats.duration_seconds,
            peaks: stats.peaks.clone(),
            quantization: stats.quantization.clone(),
            confidence: stats.confidence.score,
        };
        let draft_options = DraftOptions {
            grid: options.quantization_grid,
            max_snap_error_ms: options.max_snap_error_ms,
            force_quantization,
            downbeat_confidence_cap: downbeat_cap,
        };
        state.detection_stats = Some(stats);
        self.finish(status, publisher, state);

        // DraftMapping
        self.enter(StageId::DraftMapping, "Building draft", cancel, publisher, state)?;
        let outcome = race(
            cancel,
            self.backends.builder.generate(
                &track,
                &draft_options,
                stage_progress(publisher, StageId::DraftMapping),
                cancel,
                drum_stem.as_deref(),
            ),
        )
        .await?;
        checkpoint(cancel)?;
        if !outcome.success {
            return Err(PipelineError::StageFailed {
                stage: StageId::DraftMapping,
                reason: outcome
                    .error
                    .unwrap_or_else(|| "draft builder failed".to_string()),
            });
        }
        let draft = outcome.draft.ok_or_else(|| PipelineError::StageFailed {
            stage: StageId::DraftMapping,
            reason: "draft builder returned no draft".to_string(),
        })?;
        let hits = draft.hits.len();
        state.draft = Some(draft);
        self.finish(format!("Mapped {} hits", hits), publisher, state);

        // Finalise
        self.enter(StageId::Finalise, "Finalising", cancel, publisher, state)?;
        state.log(
            LogLevel::Info,
            Some(StageId::Finalise),
            format!("Draft ready with {} warning(s)", state.warnings.len()),
        );
        self.finish("Draft ready", publisher, state);

        Ok(())
    }

    /// ModelLoad and Separation, falling back to passthrough on failure
    async fn separate(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
        publisher: &Arc<ProgressPublisher>,
        state: &mut RunState,
    ) -> Result<SeparationReport, PipelineError> {
        let selection = select_separation_backend(
            self.backends.separation.clone(),
            self.backends.fallback.clone(),
        );
        let mut backend = selection.backend;
        let mut fallback_reason = selection.fallback_reason;
        let mut on_fallback = fallback_reason.is_some();
        if let Some(reason) = &fallback_reason {
            self.record_fallback(state, StageId::ModelLoad, reason.clone());
        }

        self.enter(
            StageId::ModelLoad,
            format!("Loading {} model", backend.name()),
            cancel,
            publisher,
            state,
        )?;
        if let Err(err) = self.load_model(&backend, cancel).await {
            if err.is_cancellation() || on_fallback {
                return Err(err);
            }
            let reason = format!(
                "Separation model load failed ({}); continuing with passthrough audio",
                err.message()
            );
            self.record_fallback(state, StageId::ModelLoad, reason.clone());
            backend = self.backends.fallback.clone();
            fallback_reason = Some(reason);
            on_fallback = true;

            // Revisit ModelLoad so the fallback load accumulates onto it
            self.finish("Model load failed", publisher, state);
            self.enter(
                StageId::ModelLoad,
                format!("Loading {} model", backend.name()),
                cancel,
                publisher,
                state,
            )?;
            self.load_model(&backend, cancel).await?;
        }
        self.finish("Model loaded", publisher, state);

        self.enter(StageId::Separation, "Isolating drums", cancel, publisher, state)?;
        let output = match self.separate_with(&backend, &request.audio_path, cancel, publisher).await {
            Ok(output) => output,
            Err(err) if err.is_cancellation() || on_fallback => return Err(err),
            Err(err) => {
                let reason = format!(
                    "Drum separation failed ({}); continuing with passthrough audio",
                    err.message()
                );
                self.record_fallback(state, StageId::Separation, reason.clone());
                backend = self.backends.fallback.clone();
                fallback_reason = Some(reason);
                self.separate_with(&backend, &request.audio_path, cancel, publisher)
                    .await?
            }
        };
        self.finish(
            if output.is_passthrough {
                "Using original mix"
            } else {
                "Drums isolated"
            },
            publisher,
            state,
        );

        Ok(SeparationReport {
            backend: backend.name().to_string(),
            is_passthrough: output.is_passthrough,
            drums_path: output.drums_path,
            fallback_reason,
        })
    }

    async fn load_model(
        &self,
        backend: &Arc<dyn SeparationBackend>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let timeout_ms = self.config.pipeline.model_load_timeout_ms;
        let load = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            backend.load_model(cancel),
        );
        match race(cancel, load).await? {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::Backend(BackendError::Timeout {
                operation: format!("{} model load", backend.name()),
                timeout_ms,
            })),
        }
    }

    async fn separate_with(
        &self,
        backend: &Arc<dyn SeparationBackend>,
        audio_path: &Path,
        cancel: &CancellationToken,
        publisher: &Arc<ProgressPublisher>,
    ) -> Result<SeparationOutput, PipelineError> {
        let separation = backend.separate(
            audio_path,
            cancel,
            stage_progress(publisher, StageId::Separation),
        );
        Ok(race(cancel, separation).await??)
    }

    fn record_fallback(&self, state: &mut RunState, stage: StageId, reason: String) {
        state.record_metric(MetricEvent::SeparationFallback {
            run_id: state.run_id(),
            reason: reason.clone(),
        });
        state.warn(Some(stage), reason);
    }

    /// Check for cancellation, then open `stage` and announce it
    fn enter(
        &self,
        stage: StageId,
        status: impl Into<String>,
        cancel: &CancellationToken,
        publisher: &ProgressPublisher,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        checkpoint(cancel)?;
        state.begin_stage(stage);
        publisher.update_context(state.merged_warning(), state.stage_durations.clone());
        publisher.stage_started(stage, status);
        Ok(())
    }

    /// Close the open stage, record its timing and publish its final event
    fn finish(&self, status: impl Into<String>, publisher: &ProgressPublisher, state: &mut RunState) {
        let Some((stage, elapsed_ms)) = state.end_active_stage() else {
            return;
        };
        state.log(
            LogLevel::Info,
            Some(stage),
            format!("{} finished in {} ms", stage.display_name(), elapsed_ms),
        );
        state.record_metric(MetricEvent::StageCompleted {
            run_id: state.run_id(),
            stage,
            elapsed_ms,
        });
        publisher.update_context(state.merged_warning(), state.stage_durations.clone());
        publisher.stage_finished(stage, status);
    }
}

fn grid_status(stats: &DetectionStats) -> String {
    let primary = &stats.quantization.primary;
    format!(
        "{:.1} BPM on {} grid ({:.0}% coverage)",
        primary.bpm,
        stats.quantization.grid_name(),
        primary.coverage * 100.0
    )
}

fn stage_progress(publisher: &Arc<ProgressPublisher>, stage: StageId) -> ProgressCallback {
    let publisher = publisher.clone();
    Arc::new(move |local| {
        publisher.progress(stage, local);
    })
}

/// Readable text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Await `future` unless the run is cancelled first
async fn race<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        output = future => Ok(output),
    }
}
