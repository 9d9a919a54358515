// ProgressEvent + ProgressPublisher
//
// The publisher is the single writer of a run's event stream. It keeps the
// last published event under one lock so heartbeats can re-emit it, clamps
// the global percent so it never decreases, throttles intermediate updates,
// and closes the stream after the terminal event.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::result::PipelineResult;
use super::stage::{PipelineState, ProgressWeighting, StageId};

/// One immutable progress tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: u64,
    pub stage: StageId,
    pub state: PipelineState,
    /// Progress within the current stage (0.0-1.0)
    pub local_progress: f32,
    /// Weighted progress across the whole run (0.0-100.0)
    pub global_percent: f64,
    pub status: String,
    /// Merged, deduplicated warnings raised so far
    pub warning: Option<String>,
    pub is_heartbeat: bool,
    /// Elapsed milliseconds per completed stage
    pub stage_durations: BTreeMap<StageId, u64>,
    pub timestamp_ms: u64,
    /// Present only on the terminal event
    pub result: Option<Box<PipelineResult>>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.result.is_some()
    }
}

struct PublisherState {
    last: Option<ProgressEvent>,
    status: String,
    warning: Option<String>,
    stage_durations: BTreeMap<StageId, u64>,
    last_percent: f64,
    last_sent: Option<Instant>,
    closed: bool,
}

/// Single-writer event publisher for one run
pub struct ProgressPublisher {
    run_id: u64,
    weighting: ProgressWeighting,
    throttle: Duration,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    state: Mutex<PublisherState>,
}

impl ProgressPublisher {
    pub fn new(
        run_id: u64,
        weighting: ProgressWeighting,
        throttle: Duration,
        tx: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Self {
        Self {
            run_id,
            weighting,
            throttle,
            tx,
            state: Mutex::new(PublisherState {
                last: None,
                status: String::new(),
                warning: None,
                stage_durations: BTreeMap::new(),
                last_percent: 0.0,
                last_sent: None,
                closed: false,
            }),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Replace the warning and stage-duration snapshot carried by later events
    pub fn update_context(&self, warning: Option<String>, stage_durations: BTreeMap<StageId, u64>) {
        if let Ok(mut state) = self.state.lock() {
            state.warning = warning;
            state.stage_durations = stage_durations;
        }
    }

    /// Emit the "stage started" event at local progress 0 (never throttled)
    pub fn stage_started(&self, stage: StageId, status: impl Into<String>) -> bool {
        self.emit(stage, 0.0, Some(status.into()), true)
    }

    /// Emit an intermediate progress event (throttled)
    pub fn progress(&self, stage: StageId, local: f32) -> bool {
        let force = local >= 1.0;
        self.emit(stage, local, None, force)
    }

    /// Emit the final event of a stage (never throttled)
    pub fn stage_finished(&self, stage: StageId, status: impl Into<String>) -> bool {
        self.emit(stage, 1.0, Some(status.into()), true)
    }

    /// Re-publish the last known event flagged as a heartbeat
    ///
    /// Returns false once the stream is closed or the consumer is gone.
    pub fn heartbeat(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        if state.closed {
            return false;
        }
        let Some(last) = state.last.as_ref() else {
            return true;
        };

        let mut event = last.clone();
        event.is_heartbeat = true;
        event.timestamp_ms = now_timestamp_ms();
        self.tx.send(event).is_ok()
    }

    /// Publish the terminal event and close the stream
    ///
    /// Only the first call has any effect.
    pub fn publish_terminal(&self, result: PipelineResult) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.closed {
            return false;
        }
        state.closed = true;

        let stage = state
            .last
            .as_ref()
            .map(|e| e.stage)
            .unwrap_or(StageId::AudioInit);

        let (global_percent, local_progress) = if result.success() {
            (100.0, 1.0)
        } else {
            let local = state.last.as_ref().map(|e| e.local_progress).unwrap_or(0.0);
            (state.last_percent, local)
        };

        let status = match &result.outcome {
            super::result::PipelineOutcome::Success => "Completed".to_string(),
            super::result::PipelineOutcome::Cancelled => "Cancelled".to_string(),
            super::result::PipelineOutcome::Failure { reason } => format!("Failed: {}", reason),
        };

        let event = ProgressEvent {
            run_id: self.run_id,
            stage,
            state: result.final_state,
            local_progress,
            global_percent,
            status,
            warning: result.warning.clone(),
            is_heartbeat: false,
            stage_durations: result.stage_durations.clone(),
            timestamp_ms: now_timestamp_ms(),
            result: Some(Box::new(result)),
        };

        state.last_percent = global_percent;
        state.last = Some(event.clone());
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Last event published or recorded (throttled updates included)
    pub fn last_event(&self) -> Option<ProgressEvent> {
        self.state.lock().ok().and_then(|s| s.last.clone())
    }

    fn emit(&self, stage: StageId, local: f32, status: Option<String>, force: bool) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.closed {
            return false;
        }

        if let Some(status) = status {
            state.status = status;
        }

        let percent = self
            .weighting
            .global_percent(stage, local)
            .max(state.last_percent);
        state.last_percent = percent;

        let event = ProgressEvent {
            run_id: self.run_id,
            stage,
            state: PipelineState::Running(stage),
            local_progress: if local.is_finite() {
                local.clamp(0.0, 1.0)
            } else {
                0.0
            },
            global_percent: percent,
            status: state.status.clone(),
            warning: state.warning.clone(),
            is_heartbeat: false,
            stage_durations: state.stage_durations.clone(),
            timestamp_ms: now_timestamp_ms(),
            result: None,
        };

        let now = Instant::now();
        let throttled = !force
            && state
                .last_sent
                .map(|sent| now.duration_since(sent) < self.throttle)
                .unwrap_or(false);

        state.last = Some(event.clone());
        if throttled {
            return false;
        }

        state.last_sent = Some(now);
        // Sent under the lock so heartbeats cannot interleave out of order
        self.tx.send(event).is_ok()
    }
}

pub(crate) fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
