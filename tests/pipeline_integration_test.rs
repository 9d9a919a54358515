//! Integration tests for the run coordinator and pipeline orchestrator
//!
//! These tests drive full runs against WAV click tracks and scripted
//! backends, covering:
//! - Weighted progress ordering and the single terminal event
//! - Cancellation from the run handle and from a caller token
//! - Single-flight rejection
//! - Separation fallback (probe, load failure, load timeout)
//! - Low-confidence degradation and fatal draft-builder failures

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rhythm_drafter::error::PipelineError;
use rhythm_drafter::pipeline::{ProgressPublisher, ProgressWeighting};
use rhythm_drafter::testing::{write_click_wav, ScriptedDraftBuilder, ScriptedSeparation};
use rhythm_drafter::{
    AppConfig, PipelineBackends, PipelineOptions, PipelineOrchestrator, PipelineRequest,
    PipelineState, ProgressEvent, RunCoordinator, StageId,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ClickFile(PathBuf);

impl ClickFile {
    fn new(name: &str, count: usize) -> Self {
        Self(write_click_wav(name, 120.0, count, 0.25))
    }

    fn request(&self) -> PipelineRequest {
        PipelineRequest::new(&self.0)
    }
}

impl Drop for ClickFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn coordinator(config: AppConfig, backends: PipelineBackends) -> RunCoordinator {
    RunCoordinator::new(PipelineOrchestrator::new(config, backends))
}

fn assert_well_ordered(events: &[ProgressEvent]) {
    assert!(!events.is_empty(), "no events received");
    assert!(
        events
            .windows(2)
            .all(|w| w[1].global_percent >= w[0].global_percent),
        "progress regressed"
    );
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_run_reports_weighted_progress() {
    let file = ClickFile::new("full_run", 32);
    let config = AppConfig::default();
    let coordinator = coordinator(config.clone(), PipelineBackends::offline(&config));

    let mut subscription = coordinator.subscribe();
    let handle = coordinator.start(file.request(), None).unwrap();
    let (events, result) = tokio::join!(subscription.until_terminal(), handle.wait());

    assert!(result.success(), "{:?}", result.failure_reason());
    assert_eq!(result.final_state, PipelineState::Completed);
    assert_well_ordered(&events);
    assert_eq!(events.last().unwrap().global_percent, 100.0);

    for stage in StageId::ALL {
        assert!(
            events.iter().any(|e| e.stage == stage && !e.is_heartbeat),
            "no event for {:?}",
            stage
        );
        assert!(result.stage_durations.contains_key(&stage));
    }

    let stats = result.detection_stats.as_ref().unwrap();
    assert_eq!(stats.peak_count, 32);
    assert!((stats.quantization.primary.bpm - 120.0).abs() < 1.0);
    assert!(result.waveform.is_some());
    assert!(result.draft.is_some());
    assert!(!coordinator.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_run_yields_cancelled() {
    let file = ClickFile::new("cancel_mid_run", 16);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::slow(Duration::from_secs(5))),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let mut subscription = coordinator.subscribe();
    let handle = coordinator.start(file.request(), None).unwrap();

    // Wait until separation is under way
    loop {
        let event = subscription.next().await.unwrap();
        if event.stage == StageId::Separation {
            break;
        }
    }
    handle.cancel();
    let result = handle.wait().await;

    assert!(result.cancelled());
    assert_eq!(result.final_state, PipelineState::Cancelled);
    assert!(result.failure_reason().is_none());
    assert!(result.stage_durations.contains_key(&StageId::Separation));
    assert!(result.detection_stats.is_none());

    let rest = subscription.until_terminal().await;
    let terminal = rest.last().unwrap();
    assert!(terminal.is_terminal());
    assert_eq!(terminal.state, PipelineState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_events_after_terminal() {
    let mut config = AppConfig::default();
    config.pipeline.heartbeat_interval_ms = 10;
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::slow(Duration::from_secs(5))),
        ..PipelineBackends::offline(&config)
    };
    let orchestrator = PipelineOrchestrator::new(config, backends);
    let file = ClickFile::new("no_events_after_terminal", 8);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let publisher = Arc::new(ProgressPublisher::new(
        1,
        ProgressWeighting::default(),
        Duration::from_millis(0),
        tx,
    ));
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = orchestrator.run(1, file.request(), token, publisher).await;
    assert!(result.cancelled());

    // Give a stray heartbeat time to show up
    tokio::time::sleep(Duration::from_millis(60)).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_well_ordered(&events);
    assert!(events.iter().any(|e| e.is_heartbeat));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_start_rejected_while_running() {
    let file = ClickFile::new("single_flight", 16);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::slow(Duration::from_secs(5))),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let first = coordinator.start(file.request(), None).unwrap();
    let err = coordinator.start(file.request(), None).err().unwrap();
    assert_eq!(err, PipelineError::AlreadyRunning);

    assert_eq!(coordinator.cancel_active(), Some(first.run_id()));
    assert!(first.wait().await.cancelled());

    // Slot is free again once the terminal result is out
    let second = coordinator.start(file.request(), None).unwrap();
    assert!(second.run_id() > 1);
    second.cancel();
    assert!(second.wait().await.cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_caller_token_cancels_run() {
    let file = ClickFile::new("caller_token", 16);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::slow(Duration::from_secs(5))),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let parent = CancellationToken::new();
    let handle = coordinator
        .start(file.request(), Some(parent.clone()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    parent.cancel();

    assert_eq!(handle.wait().await.final_state, PipelineState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_model_load_timeout_falls_back_to_passthrough() {
    let file = ClickFile::new("load_timeout", 32);
    let mut config = AppConfig::default();
    config.pipeline.model_load_timeout_ms = 50;
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::hanging_load()),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let result = coordinator
        .start(file.request(), None)
        .unwrap()
        .wait()
        .await;

    assert!(result.success(), "{:?}", result.failure_reason());
    let separation = result.separation.as_ref().unwrap();
    assert!(separation.is_passthrough);
    assert!(separation
        .fallback_reason
        .as_deref()
        .unwrap()
        .contains("timed out after 50 ms"));
    assert!(result.warning.as_deref().unwrap().contains("passthrough"));
    assert!(result.stage_durations[&StageId::ModelLoad] >= 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unavailable_backend_warns_and_continues() {
    let file = ClickFile::new("unavailable", 32);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::unavailable("no GPU")),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let result = coordinator
        .start(file.request(), None)
        .unwrap()
        .wait()
        .await;

    assert!(result.success());
    assert!(result.warnings.iter().any(|w| w.contains("no GPU")));
    assert_eq!(result.separation.unwrap().backend, "passthrough");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_separation_failure_falls_back() {
    let file = ClickFile::new("separation_failure", 32);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::failing_separation("out of memory")),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let result = coordinator
        .start(file.request(), None)
        .unwrap()
        .wait()
        .await;

    assert!(result.success());
    assert!(result.warning.as_deref().unwrap().contains("out of memory"));
    assert!(result.separation.unwrap().is_passthrough);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drum_stem_passed_to_builder() {
    let file = ClickFile::new("drum_stem", 32);
    let config = AppConfig::default();
    let builder = Arc::new(ScriptedDraftBuilder::snapping());
    let backends = PipelineBackends {
        separation: Arc::new(ScriptedSeparation::default()),
        builder: builder.clone(),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let result = coordinator
        .start(file.request(), None)
        .unwrap()
        .wait()
        .await;

    assert!(result.success());
    let calls = builder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.as_deref(), Some(file.0.as_path()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_low_confidence_disables_forced_quantization() {
    let file = ClickFile::new("low_confidence", 6);
    let config = AppConfig::default();
    let builder = Arc::new(ScriptedDraftBuilder::snapping());
    let backends = PipelineBackends {
        builder: builder.clone(),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let request = file.request().with_options(PipelineOptions {
        confidence_threshold: 0.95,
        force_quantization: true,
        ..PipelineOptions::default()
    });
    let result = coordinator.start(request, None).unwrap().wait().await;

    assert!(result.success(), "{:?}", result.failure_reason());
    assert!(result.detection_stats.as_ref().unwrap().confidence.is_low);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("Low detection confidence")));

    let calls = builder.calls();
    let (options, _) = &calls[0];
    assert!(!options.force_quantization);
    assert_eq!(options.downbeat_confidence_cap, Some(0.5));
    assert!(result.draft.unwrap().downbeat_confidence <= 0.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_builder_failure_faults_with_partial_state() {
    let file = ClickFile::new("builder_failure", 32);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        builder: Arc::new(ScriptedDraftBuilder::failing("no playable notes")),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let mut subscription = coordinator.subscribe();
    let handle = coordinator.start(file.request(), None).unwrap();
    let (events, result) = tokio::join!(subscription.until_terminal(), handle.wait());

    assert_eq!(result.final_state, PipelineState::Faulted);
    assert!(result.failure_reason().unwrap().contains("no playable notes"));
    assert!(result.detection_stats.is_some());
    assert!(result.waveform.is_some());
    assert!(result.draft.is_none());
    assert_well_ordered(&events);
    assert!(events.last().unwrap().global_percent < 100.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_builder_panic_faults_and_frees_slot() {
    let file = ClickFile::new("builder_panic", 32);
    let config = AppConfig::default();
    let backends = PipelineBackends {
        builder: Arc::new(ScriptedDraftBuilder::panicking("mapping exploded")),
        ..PipelineBackends::offline(&config)
    };
    let coordinator = coordinator(config, backends);

    let mut subscription = coordinator.subscribe();
    let handle = coordinator.start(file.request(), None).unwrap();
    let (events, result) = tokio::join!(subscription.until_terminal(), handle.wait());

    assert_eq!(result.final_state, PipelineState::Faulted);
    assert!(result.failure_reason().unwrap().contains("mapping exploded"));
    assert_eq!(events.last().unwrap().state, PipelineState::Faulted);

    // Stages completed before the panic stay in the result
    assert!(result.waveform.is_some());
    assert!(result.detection_stats.is_some());
    assert!(result.stage_durations.contains_key(&StageId::TempoGrid));
    assert!(result.stage_durations.contains_key(&StageId::DraftMapping));
    assert!(result.logs.len() > 1);

    let next = coordinator.start(file.request(), None).unwrap();
    next.cancel();
    next.wait().await;
}
