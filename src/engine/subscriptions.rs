use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::pipeline::ProgressEvent;

/// Consumer view of the coordinator's event stream
///
/// Drops events from runs older than the newest run seen, and anything a run
/// sends after its terminal event.
pub struct RunSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
    filter: StaleRunFilter,
}

impl RunSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<ProgressEvent>) -> Self {
        Self {
            rx,
            filter: StaleRunFilter::default(),
        }
    }

    /// Next accepted event; None once the coordinator is gone
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.accept(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Accepted events until the terminal event of the current run
    pub async fn until_terminal(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    /// Forward accepted events into an unbounded channel
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_receiver(mut self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = self.next().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Unpin {
        UnboundedReceiverStream::new(self.into_receiver())
    }
}

/// Tracks the newest run id and whether it has terminated
#[derive(Debug, Default, Clone)]
pub struct StaleRunFilter {
    latest_run: u64,
    terminated: bool,
}

impl StaleRunFilter {
    pub fn accept(&mut self, event: &ProgressEvent) -> bool {
        if event.run_id < self.latest_run {
            tracing::debug!(
                run_id = event.run_id,
                latest = self.latest_run,
                "dropping stale progress event"
            );
            return false;
        }
        if event.run_id > self.latest_run {
            self.latest_run = event.run_id;
            self.terminated = false;
        }
        if self.terminated {
            return false;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        true
    }

    pub fn latest_run(&self) -> u64 {
        self.latest_run
    }
}
