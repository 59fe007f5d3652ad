use crate::concurrency::{AdmitError, ConcurrencyManager, SlotPermit};
use crate::config::LaneConfig;
use crate::estimator::{classify_lane, estimate_resources};
use foldgate_model::{JobInput, Lane, ResourceEstimate, UserId};
use std::sync::Arc;

/// A granted admission: the selected lane, the advisory estimate, and the
/// slot the caller must settle exactly once when the job terminates.
pub struct Admission {
    pub lane: Lane,
    pub estimate: ResourceEstimate,
    pub permit: SlotPermit,
}

/// Admission controller: one fast decision, no internal retries. Callers
/// decide whether to retry later from the typed rejection.
pub struct JobRouter {
    manager: Arc<ConcurrencyManager>,
    lanes: LaneConfig,
}

impl JobRouter {
    #[must_use]
    pub fn new(manager: Arc<ConcurrencyManager>, lanes: LaneConfig) -> Arc<Self> {
        Arc::new(Self { manager, lanes })
    }

    pub async fn route(
        &self,
        user: &UserId,
        input: &JobInput,
        lane_hint: Option<Lane>,
    ) -> Result<Admission, AdmitError> {
        let estimate = estimate_resources(input);
        let lane = classify_lane(&estimate, lane_hint, &self.lanes);
        let permit = self.manager.acquire_slot(user, lane, &estimate).await?;
        Ok(Admission {
            lane,
            estimate,
            permit,
        })
    }

    /// Batch admission: one slot sized to the summed estimate of every
    /// child; the parent holds the slot until the batch terminates.
    pub async fn route_batch(
        &self,
        user: &UserId,
        children: &[JobInput],
        lane_hint: Option<Lane>,
    ) -> Result<(Admission, Vec<ResourceEstimate>), AdmitError> {
        let child_estimates: Vec<ResourceEstimate> =
            children.iter().map(estimate_resources).collect();
        let total = ResourceEstimate {
            gpu_seconds: child_estimates.iter().map(|e| e.gpu_seconds).sum(),
            memory_gb: child_estimates
                .iter()
                .map(|e| e.memory_gb)
                .fold(0.0, f64::max),
            storage_gb: child_estimates.iter().map(|e| e.storage_gb).sum(),
            ligand_count: child_estimates.iter().map(|e| e.ligand_count).sum(),
            protein_length: child_estimates.iter().map(|e| e.protein_length).max().unwrap_or(0),
        };
        // Batches are bulk work by construction unless trivially small.
        let lane = classify_lane(&total, lane_hint, &self.lanes);
        let permit = self.manager.acquire_slot(user, lane, &total).await?;
        Ok((
            Admission {
                lane,
                estimate: total,
                permit,
            },
            child_estimates,
        ))
    }
}
