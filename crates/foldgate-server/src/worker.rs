use crate::cascade::{CompletionCascade, CompletionEvent};
use crate::telemetry::metrics::OrchestratorMetrics;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Bounded intake for completion events consumed by a fixed worker pool.
/// Back-pressure is visible: a full queue sheds at the HTTP boundary rather
/// than spawning unbounded tasks, and processing failures are counted as
/// dead letters instead of vanishing with a dropped task.
pub struct CompletionQueue {
    tx: mpsc::Sender<CompletionEvent>,
    metrics: Arc<OrchestratorMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFull;

impl CompletionQueue {
    #[must_use]
    pub fn start(
        depth: usize,
        workers: usize,
        cascade: Arc<CompletionCascade>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<CompletionEvent>(depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let cascade = Arc::clone(&cascade);
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    let Some(event) = event else {
                        debug!(worker_id, "completion queue closed, worker exiting");
                        break;
                    };
                    metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    if let Err(e) = cascade.process(&event).await {
                        metrics
                            .events_dead_letter_total
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            worker_id,
                            event_id = %event.event_id,
                            "completion processing dead-lettered: {e}"
                        );
                    }
                }
            });
        }
        Arc::new(Self { tx, metrics })
    }

    pub fn try_enqueue(&self, event: CompletionEvent) -> Result<(), QueueFull> {
        // Gauge up before the send so a fast worker cannot decrement first.
        self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                self.metrics.queue_shed_total.fetch_add(1, Ordering::Relaxed);
                Err(QueueFull)
            }
        }
    }
}
