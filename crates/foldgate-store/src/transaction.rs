// SPDX-License-Identifier: Apache-2.0

use crate::paths::{temp_path, ResultScope};
use crate::{ObjectStore, StoreError, StoreErrorCode};
use foldgate_core::sha256_hex;
use foldgate_core::time::unix_millis;
use foldgate_model::JobId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

static TXN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    TempWrite,
    Validate,
    Move,
    ReverseMove,
    Cleanup,
    Commit,
    Rollback,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TempWrite => "temp_write",
            Self::Validate => "validate",
            Self::Move => "move",
            Self::ReverseMove => "reverse_move",
            Self::Cleanup => "cleanup",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub logical: String,
    pub path: String,
    pub at_epoch_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedResult {
    pub transaction_id: String,
    /// logical name -> final path, all present in the final namespace.
    pub final_files: BTreeMap<String, String>,
}

/// Multi-file commit with all-or-nothing visibility in the final namespace.
///
/// Protocol: stage every artifact under `tmp/{transaction_id}/`, validate
/// all staged objects are present and non-empty, then move them into place
/// one at a time. A failed move reverses the completed moves and deletes the
/// temps; a reader of the final namespace never sees a partial result set.
pub struct ResultTransaction {
    id: String,
    scope: ResultScope,
    temp_files: BTreeMap<String, String>,
    final_files: BTreeMap<String, String>,
    moved: Vec<String>,
    operations: Vec<OperationRecord>,
    committed: bool,
    rolled_back: bool,
}

impl ResultTransaction {
    #[must_use]
    pub fn begin(job: &JobId, scope: ResultScope) -> Self {
        let seq = TXN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nonce = sha256_hex(format!("{job}:{}:{seq}", unix_millis()).as_bytes());
        Self {
            id: format!("{job}-{}", &nonce[..12]),
            scope,
            temp_files: BTreeMap::new(),
            final_files: BTreeMap::new(),
            moved: Vec::new(),
            operations: Vec::new(),
            committed: false,
            rolled_back: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn operations(&self) -> &[OperationRecord] {
        &self.operations
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    #[must_use]
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    fn record(&mut self, kind: OperationKind, logical: &str, path: &str) {
        self.operations.push(OperationRecord {
            kind,
            logical: logical.to_string(),
            path: path.to_string(),
            at_epoch_ms: unix_millis() as u64,
        });
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.committed || self.rolled_back {
            return Err(StoreError::new(
                StoreErrorCode::Conflict,
                "transaction is already settled",
            ));
        }
        Ok(())
    }

    /// Writes one artifact to the transaction's temp area.
    pub async fn stage(
        &mut self,
        store: &dyn ObjectStore,
        logical_name: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let temp = temp_path(&self.id, logical_name);
        store.put(&temp, bytes).await?;
        self.record(OperationKind::TempWrite, logical_name, &temp);
        self.temp_files.insert(logical_name.to_string(), temp);
        self.final_files
            .insert(logical_name.to_string(), self.scope.final_path(logical_name));
        Ok(())
    }

    /// Confirms every staged artifact exists and is non-empty. A transaction
    /// must never finalize on top of a partial write; failure rolls back.
    pub async fn validate(&mut self, store: &dyn ObjectStore) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.temp_files.is_empty() {
            self.rollback(store).await;
            return Err(StoreError::new(
                StoreErrorCode::Validation,
                "transaction has no staged artifacts",
            ));
        }
        let staged: Vec<(String, String)> = self
            .temp_files
            .iter()
            .map(|(l, p)| (l.clone(), p.clone()))
            .collect();
        for (logical, temp) in staged {
            let ok = match store.exists(&temp).await {
                Ok(true) => store.get(&temp).await.map(|b| !b.is_empty()).unwrap_or(false),
                _ => false,
            };
            if !ok {
                self.rollback(store).await;
                return Err(StoreError::new(
                    StoreErrorCode::Validation,
                    format!("staged artifact {logical} is missing or empty"),
                ));
            }
            self.record(OperationKind::Validate, &logical, &temp);
        }
        Ok(())
    }

    /// Moves staged artifacts into the final namespace one at a time, then
    /// commits. Any move failure rolls the whole transaction back.
    pub async fn finalize(
        &mut self,
        store: &dyn ObjectStore,
    ) -> Result<CommittedResult, StoreError> {
        self.ensure_open()?;
        let pending: Vec<(String, String, String)> = self
            .temp_files
            .iter()
            .map(|(l, t)| (l.clone(), t.clone(), self.scope.final_path(l)))
            .collect();
        for (logical, temp, final_path) in pending {
            if let Err(err) = store.move_object(&temp, &final_path).await {
                warn!(
                    transaction = %self.id,
                    artifact = %logical,
                    "finalize move failed, rolling back: {err}"
                );
                self.rollback(store).await;
                return Err(StoreError::new(
                    StoreErrorCode::FinalizeFailed,
                    format!("finalize failed at artifact {logical}"),
                ));
            }
            self.record(OperationKind::Move, &logical, &final_path);
            self.moved.push(logical);
        }
        self.commit(store).await;
        Ok(CommittedResult {
            transaction_id: self.id.clone(),
            final_files: self.final_files.clone(),
        })
    }

    async fn commit(&mut self, store: &dyn ObjectStore) {
        let temps: Vec<(String, String)> = self
            .temp_files
            .iter()
            .map(|(l, p)| (l.clone(), p.clone()))
            .collect();
        for (logical, temp) in temps {
            let _ = store.delete(&temp).await;
            self.record(OperationKind::Cleanup, &logical, &temp);
        }
        self.committed = true;
        self.record(OperationKind::Commit, "", "");
    }

    /// Best-effort reverse of completed moves plus deletion of temps.
    /// Callers must treat a rolled-back transaction as "nothing committed".
    async fn rollback(&mut self, store: &dyn ObjectStore) {
        if self.committed || self.rolled_back {
            return;
        }
        let reversals: Vec<(String, String, String)> = self
            .moved
            .iter()
            .filter_map(|logical| {
                let final_path = self.final_files.get(logical)?;
                let temp = self.temp_files.get(logical)?;
                Some((logical.clone(), final_path.clone(), temp.clone()))
            })
            .collect();
        for (logical, final_path, temp) in reversals {
            if let Err(err) = store.move_object(&final_path, &temp).await {
                // Reversal is best effort; fall back to deleting the final
                // object so the partial set never stays visible.
                warn!(transaction = %self.id, "reverse move failed: {err}");
                let _ = store.delete(&final_path).await;
            }
            self.record(OperationKind::ReverseMove, &logical, &temp);
        }
        let temps: Vec<(String, String)> = self
            .temp_files
            .iter()
            .map(|(l, p)| (l.clone(), p.clone()))
            .collect();
        for (logical, temp) in temps {
            let _ = store.delete(&temp).await;
            self.record(OperationKind::Cleanup, &logical, &temp);
        }
        self.moved.clear();
        self.rolled_back = true;
        self.record(OperationKind::Rollback, "", "");
    }
}

/// Drives the full stage → validate → finalize protocol for one job result.
pub async fn commit_job_result(
    store: &dyn ObjectStore,
    job: &JobId,
    scope: ResultScope,
    artifacts: &[(&str, Vec<u8>)],
) -> Result<CommittedResult, StoreError> {
    let mut txn = ResultTransaction::begin(job, scope);
    for (logical, bytes) in artifacts {
        txn.stage(store, logical, bytes).await?;
    }
    txn.validate(store).await?;
    txn.finalize(store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::paths::{METADATA_FILE, RESULTS_FILE};

    fn job() -> JobId {
        JobId::parse("job-tx").expect("job id")
    }

    #[tokio::test]
    async fn committed_transaction_publishes_all_artifacts() {
        let store = InMemoryStore::default();
        let scope = ResultScope::Individual { job: job() };
        let committed = commit_job_result(
            &store,
            &job(),
            scope,
            &[
                (RESULTS_FILE, b"{\"ok\":true}".to_vec()),
                (METADATA_FILE, b"{\"attempt\":1}".to_vec()),
            ],
        )
        .await
        .expect("commit");
        assert_eq!(committed.final_files.len(), 2);
        for path in committed.final_files.values() {
            assert!(store.exists(path).await.expect("exists"));
        }
        // Temp area is cleaned after commit.
        assert!(store
            .list_prefix("tmp/")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn empty_staging_set_fails_validation() {
        let store = InMemoryStore::default();
        let mut txn = ResultTransaction::begin(&job(), ResultScope::Individual { job: job() });
        let err = txn.validate(&store).await.expect_err("must fail");
        assert_eq!(err.code, StoreErrorCode::Validation);
        assert!(txn.is_rolled_back());
    }

    #[tokio::test]
    async fn empty_artifact_fails_validation_and_cleans_temps() {
        let store = InMemoryStore::default();
        let mut txn = ResultTransaction::begin(&job(), ResultScope::Individual { job: job() });
        txn.stage(&store, RESULTS_FILE, b"data").await.expect("stage");
        txn.stage(&store, METADATA_FILE, b"").await.expect("stage");
        let err = txn.validate(&store).await.expect_err("must fail");
        assert_eq!(err.code, StoreErrorCode::Validation);
        assert!(txn.is_rolled_back());
        assert!(store.list_prefix("tmp/").await.is_empty());
        assert!(store.list_prefix("jobs/").await.is_empty());
    }

    #[tokio::test]
    async fn settled_transaction_rejects_further_staging() {
        let store = InMemoryStore::default();
        let mut txn = ResultTransaction::begin(&job(), ResultScope::Individual { job: job() });
        txn.stage(&store, RESULTS_FILE, b"data").await.expect("stage");
        txn.validate(&store).await.expect("validate");
        txn.finalize(&store).await.expect("finalize");
        let err = txn.stage(&store, METADATA_FILE, b"late").await;
        assert!(matches!(err, Err(e) if e.code == StoreErrorCode::Conflict));
    }
}
