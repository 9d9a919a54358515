//! Run telemetry collector and helpers.
//!
//! The collector multiplexes stage timings, separation fallbacks, low
//! confidence notices and run outcomes into a bounded history plus an async
//! broadcast stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

use crate::pipeline::StageId;

pub mod events;

pub use events::MetricEvent;

/// Global telemetry hub shared across the crate.
static HUB: Lazy<TelemetryHub> = Lazy::new(TelemetryHub::default);

/// Access the global telemetry hub.
pub fn hub() -> &'static TelemetryHub {
    &HUB
}

/// Snapshot of collector state, printed by `draft_cli run --telemetry`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<MetricEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Telemetry state stays usable after a panicking publisher
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broadcast-based collector retaining a bounded history of metrics.
pub struct TelemetryCollector {
    tx: broadcast::Sender<MetricEvent>,
    history: Mutex<VecDeque<MetricEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity: history_capacity.max(1),
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: MetricEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = lock(&self.history);
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let history = lock(&self.history);
        TelemetrySnapshot {
            recent: history.iter().cloned().collect(),
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Rolling window of stage durations used to compute avg/max timings.
struct StageTimer {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl StageTimer {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    fn observe(&mut self, elapsed_ms: u64) -> (f64, u64, usize) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed_ms);

        let count = self.samples.len();
        let sum: u64 = self.samples.iter().sum();
        let max = self.samples.iter().copied().max().unwrap_or(0);
        (sum as f64 / count as f64, max, count)
    }
}

/// Top-level hub wrapping collector state plus per-stage timers.
pub struct TelemetryHub {
    collector: TelemetryCollector,
    timing_window: usize,
    stage_timers: Mutex<HashMap<StageId, StageTimer>>,
}

impl TelemetryHub {
    pub fn new(channel_capacity: usize, history_capacity: usize, timing_window: usize) -> Self {
        Self {
            collector: TelemetryCollector::new(channel_capacity, history_capacity),
            timing_window,
            stage_timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.collector.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.collector.subscribe()
    }

    /// Publish `event`; completed stages also refresh the rolling timing
    pub fn record(&self, event: MetricEvent) {
        let timing = match &event {
            MetricEvent::StageCompleted {
                stage, elapsed_ms, ..
            } => Some((*stage, *elapsed_ms)),
            _ => None,
        };
        self.collector.publish(event);

        let Some((stage, elapsed_ms)) = timing else {
            return;
        };
        let (avg_ms, max_ms, sample_count) = {
            let mut timers = lock(&self.stage_timers);
            timers
                .entry(stage)
                .or_insert_with(|| StageTimer::new(self.timing_window))
                .observe(elapsed_ms)
        };

        self.collector.publish(MetricEvent::StageTiming {
            stage,
            avg_ms,
            max_ms,
            sample_count,
        });
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(256, 64, 32)
    }
}
