// SPDX-License-Identifier: Apache-2.0

use crate::estimate::ResourceEstimate;
use crate::ids::{BatchId, CallId, JobId, UserId, ValidationError};
use serde::{Deserialize, Serialize};

pub const MAX_PROTEIN_SEQUENCES: usize = 64;
pub const MAX_PROTEIN_LENGTH: usize = 4096;
pub const MAX_LIGANDS: usize = 256;
pub const MAX_LIGAND_LEN: usize = 512;

/// Quality-of-service admission lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Interactive,
    Bulk,
}

impl Lane {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Bulk => "bulk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal lifecycle moves; terminal states accept nothing.
    #[must_use]
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            // Pending -> Failed covers synchronous dispatch failures.
            (Self::Pending, Self::Queued | Self::Failed | Self::Cancelled) => true,
            (Self::Queued, Self::Running | Self::Completed | Self::Failed | Self::Cancelled) => {
                true
            }
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// Tagged job kind carrying only the fields valid for that kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Individual,
    BatchParent { child_count: u32 },
    BatchChild { parent: BatchId, index: u32 },
}

impl JobKind {
    #[must_use]
    pub const fn parent_batch(&self) -> Option<&BatchId> {
        match self {
            Self::BatchChild { parent, .. } => Some(parent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobInput {
    pub protein_sequences: Vec<String>,
    #[serde(default)]
    pub ligands: Vec<String>,
    #[serde(default)]
    pub use_msa_server: bool,
}

impl JobInput {
    pub fn validate_strict(&self) -> Result<(), ValidationError> {
        if self.protein_sequences.is_empty() {
            return Err(ValidationError(
                "at least one protein sequence is required".to_string(),
            ));
        }
        if self.protein_sequences.len() > MAX_PROTEIN_SEQUENCES {
            return Err(ValidationError(format!(
                "protein sequence count exceeds {MAX_PROTEIN_SEQUENCES}"
            )));
        }
        for seq in &self.protein_sequences {
            if seq.is_empty() {
                return Err(ValidationError(
                    "protein sequences must not be empty".to_string(),
                ));
            }
            if seq.len() > MAX_PROTEIN_LENGTH {
                return Err(ValidationError(format!(
                    "protein sequence exceeds {MAX_PROTEIN_LENGTH} residues"
                )));
            }
            if !seq.chars().all(|c| "ACDEFGHIKLMNPQRSTVWYXBZU".contains(c)) {
                return Err(ValidationError(
                    "protein sequences must use one-letter amino acid codes".to_string(),
                ));
            }
        }
        if self.ligands.len() > MAX_LIGANDS {
            return Err(ValidationError(format!("ligand count exceeds {MAX_LIGANDS}")));
        }
        for lig in &self.ligands {
            if lig.is_empty() || lig.len() > MAX_LIGAND_LEN {
                return Err(ValidationError(format!(
                    "ligand entries must be 1..={MAX_LIGAND_LEN} characters"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn total_protein_length(&self) -> u32 {
        self.protein_sequences
            .iter()
            .map(|s| s.len() as u32)
            .sum()
    }

    #[must_use]
    pub fn ligand_count(&self) -> u32 {
        self.ligands.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub lane: Lane,
    pub owner: UserId,
    pub input: JobInput,
    pub estimate: ResourceEstimate,
    #[serde(default)]
    pub external_call_id: Option<CallId>,
    pub created_at_epoch_ms: u64,
    pub updated_at_epoch_ms: u64,
}

impl Job {
    /// Kind-specific construction rules are checked here, not at read sites.
    pub fn new(
        id: JobId,
        kind: JobKind,
        lane: Lane,
        owner: UserId,
        input: JobInput,
        estimate: ResourceEstimate,
        now_epoch_ms: u64,
    ) -> Result<Self, ValidationError> {
        input.validate_strict()?;
        if let JobKind::BatchParent { child_count } = &kind {
            if *child_count == 0 {
                return Err(ValidationError(
                    "batch parent must declare at least one child".to_string(),
                ));
            }
        }
        Ok(Self {
            id,
            kind,
            status: JobStatus::Pending,
            lane,
            owner,
            input,
            estimate,
            external_call_id: None,
            created_at_epoch_ms: now_epoch_ms,
            updated_at_epoch_ms: now_epoch_ms,
        })
    }

    /// Applies a status transition, rejecting moves the table forbids.
    pub fn apply_transition(
        &mut self,
        next: JobStatus,
        now_epoch_ms: u64,
    ) -> Result<(), ValidationError> {
        if !self.status.can_transition_to(next) {
            return Err(ValidationError(format!(
                "illegal transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at_epoch_ms = now_epoch_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> JobInput {
        JobInput {
            protein_sequences: vec!["MKTAYIAKQR".to_string()],
            ligands: vec!["CCO".to_string()],
            use_msa_server: false,
        }
    }

    fn job() -> Job {
        Job::new(
            JobId::parse("job-1").expect("id"),
            JobKind::Individual,
            Lane::Interactive,
            UserId::parse("u1").expect("user"),
            input(),
            ResourceEstimate::default(),
            1,
        )
        .expect("job")
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn queued_job_may_complete_without_running_report() {
        // Fast executors can report completion before a running heartbeat.
        let mut j = job();
        j.apply_transition(JobStatus::Queued, 2).expect("queue");
        j.apply_transition(JobStatus::Completed, 3).expect("complete");
        assert!(j.status.is_terminal());
    }

    #[test]
    fn transition_out_of_cancelled_is_rejected() {
        let mut j = job();
        j.apply_transition(JobStatus::Queued, 2).expect("queue");
        j.apply_transition(JobStatus::Cancelled, 3).expect("cancel");
        let err = j.apply_transition(JobStatus::Completed, 4);
        assert!(err.is_err());
        assert_eq!(j.status, JobStatus::Cancelled);
    }

    #[test]
    fn batch_parent_requires_children() {
        let res = Job::new(
            JobId::parse("job-2").expect("id"),
            JobKind::BatchParent { child_count: 0 },
            Lane::Bulk,
            UserId::parse("u1").expect("user"),
            input(),
            ResourceEstimate::default(),
            1,
        );
        assert!(res.is_err());
    }

    #[test]
    fn input_rejects_non_amino_characters() {
        let bad = JobInput {
            protein_sequences: vec!["MKTA1".to_string()],
            ligands: Vec::new(),
            use_msa_server: false,
        };
        assert!(bad.validate_strict().is_err());
    }
}
