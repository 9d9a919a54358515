// HeartbeatEmitter - liveness ticks during long external calls
//
// Re-publishes the publisher's last event at a fixed interval. It never
// builds new progress, so it cannot advance the state machine, and it stops
// on its own once the publisher closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressPublisher;

pub struct HeartbeatEmitter {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatEmitter {
    /// Spawn the ticker on the current tokio runtime
    pub fn spawn(publisher: Arc<ProgressPublisher>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let child = stop.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if !publisher.heartbeat() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the ticker and wait for it to exit
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
