use crate::concurrency::SlotPermit;
use crate::registry::{JobStore, RegistryError, TransitionOutcome};
use crate::telemetry::metrics::OrchestratorMetrics;
use crate::telemetry::redis_backend::RedisBackend;
use foldgate_api::wire::CompletionEventWire;
use foldgate_core::time::unix_millis;
use foldgate_model::{
    BatchAggregate, BatchFailurePolicy, BatchId, CallId, JobId, JobKind, JobStatus,
    ValidationError,
};
use foldgate_store::transaction::commit_job_result;
use foldgate_store::{
    ObjectStore, ResultScope, StoreError, BATCH_INDEX_FILE, METADATA_FILE, RESULTS_FILE,
    STRUCTURE_FILE,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Normalized completion event; webhook and polling paths both produce this
/// shape before it reaches the cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    /// Dedupe identifier; the external call id, which the sender reuses on
    /// retries.
    pub event_id: String,
    pub call_id: CallId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub metadata: Option<Value>,
}

impl CompletionEvent {
    pub fn from_wire(wire: CompletionEventWire) -> Result<Self, ValidationError> {
        let call_id = CallId::parse(&wire.call_id)?;
        let success = wire.is_success();
        Ok(Self {
            event_id: call_id.as_str().to_string(),
            call_id,
            success,
            result: wire.result,
            error: wire.error,
            metadata: wire.metadata,
        })
    }

    /// Poll-driven intake: an external status-API response normalized to
    /// the same shape the webhook path produces, so the cascade never
    /// learns which path delivered an event.
    #[must_use]
    pub fn from_poll(
        call_id: CallId,
        success: bool,
        result: Option<Value>,
        error: Option<Value>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            event_id: call_id.as_str().to_string(),
            call_id,
            success,
            result,
            error,
            metadata,
        }
    }

    /// Real GPU time when the executor reports it in event metadata.
    #[must_use]
    pub fn actual_gpu_minutes(&self) -> Option<f64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("gpu_seconds"))
            .and_then(Value::as_f64)
            .map(|secs| secs / 60.0)
    }
}

/// Seen-event markers: shared-store SET NX when Redis is configured, with a
/// process-local set that always tracks as well so a store outage degrades
/// to per-instance dedupe instead of double-processing storms.
pub struct EventDedupe {
    redis: Option<RedisBackend>,
    seen: Mutex<HashSet<String>>,
    ttl_secs: usize,
    fallback_logged: AtomicBool,
}

impl EventDedupe {
    #[must_use]
    pub fn new(redis: Option<RedisBackend>, ttl_secs: usize) -> Self {
        Self {
            redis,
            seen: Mutex::new(HashSet::new()),
            ttl_secs,
            fallback_logged: AtomicBool::new(false),
        }
    }

    /// `true` when this call claimed the id first.
    pub async fn mark_if_new(&self, event_id: &str) -> bool {
        let shared_claim = match &self.redis {
            Some(redis) => match redis.mark_event_if_new(event_id, self.ttl_secs).await {
                Ok(claimed) => Some(claimed),
                Err(e) => {
                    if !self.fallback_logged.swap(true, Ordering::Relaxed) {
                        warn!("event dedupe degraded to process-local set: {e}");
                    }
                    None
                }
            },
            None => None,
        };
        let local_claim = self.seen.lock().await.insert(event_id.to_string());
        shared_claim.unwrap_or(true) && local_claim
    }

    pub async fn unmark(&self, event_id: &str) {
        if let Some(redis) = &self.redis {
            let _ = redis.unmark_event(event_id).await;
        }
        self.seen.lock().await.remove(event_id);
    }
}

/// Live admission slots keyed by job id, so the completion path (a
/// different task, arbitrarily later) can settle the slot acquired at
/// admission.
#[derive(Default)]
pub struct PermitTable {
    inner: Mutex<HashMap<JobId, SlotPermit>>,
}

impl PermitTable {
    pub async fn insert(&self, id: JobId, permit: SlotPermit) {
        self.inner.lock().await.insert(id, permit);
    }

    pub async fn take(&self, id: &JobId) -> Option<SlotPermit> {
        self.inner.lock().await.remove(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeError {
    Storage(String),
    Registry(String),
    Internal(String),
}

impl Display for CascadeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(m) => write!(f, "storage commit failed: {m}"),
            Self::Registry(m) => write!(f, "job registry failed: {m}"),
            Self::Internal(m) => write!(f, "cascade failed: {m}"),
        }
    }
}

impl std::error::Error for CascadeError {}

impl From<StoreError> for CascadeError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<RegistryError> for CascadeError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOutcome {
    Processed { batch_done: bool },
    Duplicate,
    AlreadyTerminal,
    UnknownJob,
}

/// Drives everything that happens after an executor reports a job done:
/// result commit, terminal transition, slot settlement, and the parent
/// aggregate update with its exactly-once completion guard.
pub struct CompletionCascade {
    jobs: Arc<dyn JobStore>,
    results: Arc<dyn ObjectStore>,
    permits: Arc<PermitTable>,
    dedupe: EventDedupe,
    policy: BatchFailurePolicy,
    aggregate_retry_attempts: usize,
    metrics: Arc<OrchestratorMetrics>,
}

impl CompletionCascade {
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ObjectStore>,
        permits: Arc<PermitTable>,
        dedupe: EventDedupe,
        policy: BatchFailurePolicy,
        aggregate_retry_attempts: usize,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            results,
            permits,
            dedupe,
            policy,
            aggregate_retry_attempts: aggregate_retry_attempts.max(1),
            metrics,
        })
    }

    pub async fn process(&self, event: &CompletionEvent) -> Result<CascadeOutcome, CascadeError> {
        if !self.dedupe.mark_if_new(&event.event_id).await {
            self.metrics
                .events_duplicate_total
                .fetch_add(1, Ordering::Relaxed);
            return Ok(CascadeOutcome::Duplicate);
        }
        let outcome = self.process_unique(event).await;
        if outcome.is_err() {
            // Leave the id unclaimed so the sender's retry can reprocess;
            // every step below is idempotent under replay.
            self.dedupe.unmark(&event.event_id).await;
        }
        outcome
    }

    async fn process_unique(
        &self,
        event: &CompletionEvent,
    ) -> Result<CascadeOutcome, CascadeError> {
        let Some(job) = self.jobs.find_by_call_id(&event.call_id).await? else {
            self.metrics
                .events_unknown_job_total
                .fetch_add(1, Ordering::Relaxed);
            warn!(call_id = %event.call_id, "completion event for unknown job dropped");
            return Ok(CascadeOutcome::UnknownJob);
        };
        if job.status.is_terminal() {
            return Ok(CascadeOutcome::AlreadyTerminal);
        }

        self.commit_result(&job.id, &job.kind, event).await?;

        let next = if event.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        match self
            .jobs
            .transition_if_not_terminal(&job.id, next, unix_millis() as u64)
            .await?
        {
            TransitionOutcome::Applied(_) => {}
            // Cancelled between resolve and transition; the cancel path
            // already settled the slot.
            TransitionOutcome::AlreadyTerminal(_) => return Ok(CascadeOutcome::AlreadyTerminal),
            TransitionOutcome::NotFound => return Ok(CascadeOutcome::UnknownJob),
        }

        if let Some(permit) = self.permits.take(&job.id).await {
            let reserved = permit.reserved_gpu_minutes();
            let actual = event.actual_gpu_minutes().unwrap_or(reserved);
            permit.settle(Some(actual)).await;
        }
        self.metrics
            .events_processed_total
            .fetch_add(1, Ordering::Relaxed);

        let mut batch_done = false;
        if let JobKind::BatchChild { parent, .. } = &job.kind {
            batch_done = self.recompute_batch(parent).await?;
        }
        Ok(CascadeOutcome::Processed { batch_done })
    }

    async fn commit_result(
        &self,
        job_id: &JobId,
        kind: &JobKind,
        event: &CompletionEvent,
    ) -> Result<(), CascadeError> {
        let scope = match kind {
            JobKind::Individual => ResultScope::Individual { job: job_id.clone() },
            JobKind::BatchChild { parent, .. } => ResultScope::BatchChild {
                batch: parent.clone(),
                job: job_id.clone(),
            },
            JobKind::BatchParent { .. } => ResultScope::BatchParent {
                batch: batch_id_of(job_id)?,
            },
        };
        let metadata = event.metadata.clone().unwrap_or_else(|| json!({}));
        let mut artifacts: Vec<(&str, Vec<u8>)> = Vec::new();
        if event.success {
            let result = event.result.clone().unwrap_or_else(|| json!({}));
            // Large structure payloads land in their own artifact.
            if let Some(structure) = result.get("structure").and_then(Value::as_str) {
                if !structure.is_empty() {
                    artifacts.push((STRUCTURE_FILE, structure.as_bytes().to_vec()));
                }
            }
            artifacts.push((
                RESULTS_FILE,
                serde_json::to_vec(&json!({"status": "completed", "result": result}))
                    .map_err(|e| CascadeError::Internal(e.to_string()))?,
            ));
        } else {
            // Failure payloads are committed too, so failure reasons stay
            // queryable from the result namespace.
            let error = event.error.clone().unwrap_or_else(|| json!({}));
            artifacts.push((
                RESULTS_FILE,
                serde_json::to_vec(&json!({"status": "failed", "error": error}))
                    .map_err(|e| CascadeError::Internal(e.to_string()))?,
            ));
        }
        artifacts.push((
            METADATA_FILE,
            serde_json::to_vec(&metadata).map_err(|e| CascadeError::Internal(e.to_string()))?,
        ));

        match commit_job_result(self.results.as_ref(), job_id, scope, &artifacts).await {
            Ok(_) => {
                self.metrics
                    .storage_commits_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .storage_rollbacks_total
                    .fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Re-reads sibling statuses, persists the aggregate, and applies the
    /// guarded parent transition when the batch is done. Returns whether
    /// this call performed the parent completion.
    ///
    /// Aggregate persistence retries with a fresh read each attempt: the
    /// aggregate is idempotently recomputable, so lost-update races between
    /// concurrent children resolve to the last writer, and the terminal
    /// transition stays exactly-once via the registry guard.
    pub async fn recompute_batch(&self, batch: &BatchId) -> Result<bool, CascadeError> {
        let parent_id = JobId::parse(batch.as_str())
            .map_err(|e| CascadeError::Internal(format!("batch id is not a job id: {e}")))?;
        let mut attempt = 0;
        let aggregate = loop {
            attempt += 1;
            let children = self.jobs.children_of(batch).await?;
            let statuses: Vec<JobStatus> = children.iter().map(|c| c.status).collect();
            let aggregate = BatchAggregate::from_child_statuses(&statuses);
            let doc = json!({
                "batch_id": batch.as_str(),
                "total": aggregate.total,
                "completed": aggregate.completed,
                "failed": aggregate.failed,
                "running": aggregate.running,
                "progress": aggregate.progress(),
                "updated_at_epoch_ms": unix_millis() as u64,
            });
            let bytes =
                serde_json::to_vec(&doc).map_err(|e| CascadeError::Internal(e.to_string()))?;
            match commit_job_result(
                self.results.as_ref(),
                &parent_id,
                ResultScope::BatchParent {
                    batch: batch.clone(),
                },
                &[(BATCH_INDEX_FILE, bytes)],
            )
            .await
            {
                Ok(_) => break aggregate,
                Err(e) if e.code.is_transient() && attempt < self.aggregate_retry_attempts => {
                    warn!(batch = %batch, "aggregate write retry {attempt}: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        };

        if !aggregate.done() {
            return Ok(false);
        }
        let terminal = aggregate.parent_terminal_status(self.policy);
        match self
            .jobs
            .transition_if_not_terminal(&parent_id, terminal, unix_millis() as u64)
            .await?
        {
            TransitionOutcome::Applied(_) => {
                self.metrics
                    .batch_completions_total
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(permit) = self.permits.take(&parent_id).await {
                    let reserved = permit.reserved_gpu_minutes();
                    permit.settle(Some(reserved)).await;
                }
                Ok(true)
            }
            // A sibling completing concurrently won the race; this is the
            // accepted resolution, not an error.
            TransitionOutcome::AlreadyTerminal(_) | TransitionOutcome::NotFound => Ok(false),
        }
    }
}

fn batch_id_of(job_id: &JobId) -> Result<BatchId, CascadeError> {
    BatchId::parse(job_id.as_str())
        .map_err(|e| CascadeError::Internal(format!("job id is not a batch id: {e}")))
}
