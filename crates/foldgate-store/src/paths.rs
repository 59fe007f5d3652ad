// SPDX-License-Identifier: Apache-2.0

use foldgate_model::{BatchId, JobId};

pub const RESULTS_FILE: &str = "results.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const STRUCTURE_FILE: &str = "structure.cif";
pub const BATCH_INDEX_FILE: &str = "batch_index.json";
pub const TMP_ROOT: &str = "tmp";

/// Where a job's finalized artifacts live in the hierarchical namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultScope {
    Individual { job: JobId },
    BatchChild { batch: BatchId, job: JobId },
    /// Index/metadata document only; per-ligand results live under the
    /// children.
    BatchParent { batch: BatchId },
}

impl ResultScope {
    #[must_use]
    pub fn final_dir(&self) -> String {
        match self {
            Self::Individual { job } => format!("jobs/{job}"),
            Self::BatchChild { batch, job } => format!("batches/{batch}/jobs/{job}"),
            Self::BatchParent { batch } => format!("batches/{batch}"),
        }
    }

    #[must_use]
    pub fn final_path(&self, logical_name: &str) -> String {
        format!("{}/{}", self.final_dir(), logical_name)
    }
}

#[must_use]
pub fn temp_path(transaction_id: &str, logical_name: &str) -> String {
    format!("{TMP_ROOT}/{transaction_id}/{logical_name}")
}
