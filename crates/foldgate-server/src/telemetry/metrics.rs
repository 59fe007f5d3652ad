use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct OrchestratorMetrics {
    pub admissions_total: AtomicU64,
    pub rejections_by_reason: Mutex<HashMap<String, u64>>,
    pub webhook_accepted_total: AtomicU64,
    pub webhook_rejected_total: AtomicU64,
    pub queue_depth: AtomicU64,
    pub queue_shed_total: AtomicU64,
    pub events_processed_total: AtomicU64,
    pub events_duplicate_total: AtomicU64,
    pub events_unknown_job_total: AtomicU64,
    pub events_dead_letter_total: AtomicU64,
    pub storage_commits_total: AtomicU64,
    pub storage_rollbacks_total: AtomicU64,
    pub batch_completions_total: AtomicU64,
    pub cancellations_total: AtomicU64,
}

impl OrchestratorMetrics {
    pub async fn observe_rejection(&self, reason: &str) {
        let mut by = self.rejections_by_reason.lock().await;
        *by.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub async fn render(&self) -> String {
        let mut out = String::new();
        let scalars = [
            ("foldgate_admissions_total", &self.admissions_total),
            ("foldgate_webhook_accepted_total", &self.webhook_accepted_total),
            ("foldgate_webhook_rejected_total", &self.webhook_rejected_total),
            ("foldgate_completion_queue_depth", &self.queue_depth),
            ("foldgate_completion_queue_shed_total", &self.queue_shed_total),
            ("foldgate_events_processed_total", &self.events_processed_total),
            ("foldgate_events_duplicate_total", &self.events_duplicate_total),
            (
                "foldgate_events_unknown_job_total",
                &self.events_unknown_job_total,
            ),
            (
                "foldgate_events_dead_letter_total",
                &self.events_dead_letter_total,
            ),
            ("foldgate_storage_commits_total", &self.storage_commits_total),
            (
                "foldgate_storage_rollbacks_total",
                &self.storage_rollbacks_total,
            ),
            (
                "foldgate_batch_completions_total",
                &self.batch_completions_total,
            ),
            ("foldgate_cancellations_total", &self.cancellations_total),
        ];
        for (name, value) in scalars {
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        let by_reason = self.rejections_by_reason.lock().await;
        let mut reasons: Vec<_> = by_reason.iter().collect();
        reasons.sort();
        for (reason, count) in reasons {
            let _ = writeln!(
                out,
                "foldgate_rejections_total{{reason=\"{reason}\"}} {count}"
            );
        }
        out
    }
}
