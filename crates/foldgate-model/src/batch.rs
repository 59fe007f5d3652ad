// SPDX-License-Identifier: Apache-2.0

use crate::job::JobStatus;
use serde::{Deserialize, Serialize};

/// What a fully-terminated batch with failed children becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Parent completes; failures stay visible in the aggregate.
    #[default]
    CompleteWithFailures,
    /// Any failed child fails the parent once all children terminate.
    FailFast,
}

/// Derived roll-up of child statuses; recomputed on every child completion,
/// never the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BatchAggregate {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub running: u32,
}

impl BatchAggregate {
    #[must_use]
    pub fn from_child_statuses(statuses: &[JobStatus]) -> Self {
        let mut agg = Self {
            total: statuses.len() as u32,
            ..Self::default()
        };
        for status in statuses {
            match status {
                JobStatus::Completed => agg.completed += 1,
                JobStatus::Failed | JobStatus::Cancelled => agg.failed += 1,
                JobStatus::Running => agg.running += 1,
                JobStatus::Pending | JobStatus::Queued => {}
            }
        }
        agg
    }

    #[must_use]
    pub const fn terminal_count(&self) -> u32 {
        self.completed + self.failed
    }

    #[must_use]
    pub const fn done(&self) -> bool {
        self.total > 0 && self.terminal_count() == self.total
    }

    /// Fraction of children in a terminal state, for progress reporting.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.terminal_count()) / f64::from(self.total)
    }

    /// Terminal status for the parent once `done()`, per the batch policy.
    #[must_use]
    pub const fn parent_terminal_status(&self, policy: BatchFailurePolicy) -> JobStatus {
        match policy {
            BatchFailurePolicy::FailFast if self.failed > 0 => JobStatus::Failed,
            _ => JobStatus::Completed,
        }
    }
}
