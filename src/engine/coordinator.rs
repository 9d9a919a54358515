//! RunCoordinator: single-flight owner of pipeline runs.
//!
//! The coordinator accepts at most one run at a time, owns that run's
//! cancellation token, and republishes the run's progress events on a
//! broadcast channel. Each run executes on its own tokio task behind a
//! supervisor that still produces a terminal result if the run task itself
//! dies outside the orchestrator's panic handling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::subscriptions::RunSubscription;
use crate::error::{log_pipeline_error, PipelineError};
use crate::pipeline::orchestrator::panic_message;
use crate::pipeline::{
    LogLevel, PipelineOrchestrator, PipelineOutcome, PipelineRequest, PipelineResult,
    ProgressEvent, ProgressPublisher, RunState,
};

struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
}

/// Handle to one accepted run
pub struct RunHandle {
    run_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<PipelineResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Request cooperative cancellation of this run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal result
    pub async fn wait(self) -> PipelineResult {
        match self.task.await {
            Ok(result) => result,
            Err(err) => faulted_result(self.run_id, format!("run supervisor failed: {}", err)),
        }
    }
}

pub struct RunCoordinator {
    orchestrator: Arc<PipelineOrchestrator>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    next_run_id: AtomicU64,
    events_tx: broadcast::Sender<ProgressEvent>,
}

impl RunCoordinator {
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        let capacity = orchestrator.config().pipeline.event_channel_capacity.max(1);
        let (events_tx, _) = broadcast::channel(capacity);
        Self {
            orchestrator: Arc::new(orchestrator),
            active: Arc::new(Mutex::new(None)),
            next_run_id: AtomicU64::new(0),
            events_tx,
        }
    }

    /// Start a run; rejected while another run is in flight
    ///
    /// `caller_token`, when given, is the parent of the run's cancellation
    /// token, so cancelling it cancels the run.
    pub fn start(
        &self,
        request: PipelineRequest,
        caller_token: Option<CancellationToken>,
    ) -> Result<RunHandle, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::RuntimeUnavailable)?;
        request.options.validate()?;

        let (run_id, cancel) = {
            let mut active = lock_active(&self.active)?;
            if let Some(current) = active.as_ref() {
                tracing::warn!(active_run = current.run_id, "run rejected: already running");
                return Err(PipelineError::AlreadyRunning);
            }

            let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
            let cancel = caller_token
                .map(|parent| parent.child_token())
                .unwrap_or_default();
            *active = Some(ActiveRun {
                run_id,
                cancel: cancel.clone(),
            });
            (run_id, cancel)
        };

        tracing::info!(run_id, path = %request.audio_path.display(), "run accepted");

        let pipeline = &self.orchestrator.config().pipeline;
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(ProgressPublisher::new(
            run_id,
            self.orchestrator.weighting().clone(),
            Duration::from_millis(pipeline.progress_throttle_ms),
            tx,
        ));

        runtime.spawn(forward_events(
            run_id,
            rx,
            self.events_tx.clone(),
            self.active.clone(),
        ));

        let orchestrator = self.orchestrator.clone();
        let worker_publisher = publisher.clone();
        let worker_cancel = cancel.clone();
        let worker = runtime.spawn(async move {
            orchestrator
                .run(run_id, request, worker_cancel, worker_publisher)
                .await
        });

        let active = self.active.clone();
        let task = runtime.spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(err) => {
                    let reason = if err.is_panic() {
                        format!("run task panicked: {}", panic_message(err.into_panic().as_ref()))
                    } else {
                        "run task aborted".to_string()
                    };
                    tracing::error!(run_id, %reason, "run worker failed");
                    let result = faulted_result(run_id, reason);
                    publisher.publish_terminal(result.clone());
                    result
                }
            };
            clear_active(&active, run_id);
            result
        });

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    /// Cancel the in-flight run, returning its id
    pub fn cancel_active(&self) -> Option<u64> {
        let active = lock_active(&self.active).ok()?;
        active.as_ref().map(|run| {
            tracing::info!(run_id = run.run_id, "cancelling run");
            run.cancel.cancel();
            run.run_id
        })
    }

    pub fn active_run_id(&self) -> Option<u64> {
        lock_active(&self.active)
            .ok()
            .and_then(|active| active.as_ref().map(|run| run.run_id))
    }

    pub fn is_running(&self) -> bool {
        self.active_run_id().is_some()
    }

    /// Subscribe to progress events of current and future runs
    pub fn subscribe(&self) -> RunSubscription {
        RunSubscription::new(self.events_tx.subscribe())
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }
}

/// Republish one run's events; the active slot is released before the
/// terminal event goes out so observers can start the next run right away
async fn forward_events(
    run_id: u64,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    events_tx: broadcast::Sender<ProgressEvent>,
    active: Arc<Mutex<Option<ActiveRun>>>,
) {
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        if terminal {
            clear_active(&active, run_id);
        }
        // No subscribers is fine
        let _ = events_tx.send(event);
        if terminal {
            break;
        }
    }
}

fn lock_active(
    active: &Mutex<Option<ActiveRun>>,
) -> Result<MutexGuard<'_, Option<ActiveRun>>, PipelineError> {
    active.lock().map_err(|_| {
        let err = PipelineError::LockPoisoned {
            component: "RunCoordinator".to_string(),
        };
        log_pipeline_error(&err, "lock_active");
        err
    })
}

fn clear_active(active: &Mutex<Option<ActiveRun>>, run_id: u64) {
    let mut guard = active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.as_ref().map(|run| run.run_id) == Some(run_id) {
        *guard = None;
    }
}

fn faulted_result(run_id: u64, reason: String) -> PipelineResult {
    let mut state = RunState::new(run_id);
    state.log(LogLevel::Error, None, reason.clone());
    state.into_result(PipelineOutcome::Failure { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::{PipelineBackends, PipelineOptions};

    fn coordinator() -> RunCoordinator {
        let config = AppConfig::default();
        RunCoordinator::new(PipelineOrchestrator::new(
            config.clone(),
            PipelineBackends::offline(&config),
        ))
    }

    #[test]
    fn test_start_outside_runtime_rejected() {
        let err = coordinator()
            .start(PipelineRequest::new("take.wav"), None)
            .err()
            .unwrap();
        assert_eq!(err, PipelineError::RuntimeUnavailable);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_start() {
        let coordinator = coordinator();
        let request = PipelineRequest::new("take.wav").with_options(PipelineOptions {
            detection_sensitivity: -1.0,
            ..PipelineOptions::default()
        });
        let err = coordinator.start(request, None).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidOptions { .. }));
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_active_slot_released_after_run() {
        let coordinator = coordinator();
        let handle = coordinator
            .start(PipelineRequest::new("/no/such/file.wav"), None)
            .unwrap();
        assert_eq!(coordinator.active_run_id(), Some(handle.run_id()));

        let result = handle.wait().await;
        assert!(result.failure_reason().is_some());
        assert!(!coordinator.is_running());
        assert!(coordinator.cancel_active().is_none());
    }
}
