// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Advisory resource cost for one job; a pure function of the job input,
/// immutable once computed. Not a billing-grade figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceEstimate {
    pub gpu_seconds: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub ligand_count: u32,
    pub protein_length: u32,
}

impl ResourceEstimate {
    #[must_use]
    pub fn gpu_minutes(&self) -> f64 {
        self.gpu_seconds / 60.0
    }
}
