use async_trait::async_trait;
use foldgate_model::{BatchId, CallId, Job, JobId, JobStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError(pub String);

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Job),
    /// The job was already terminal; the caller must treat this as a no-op.
    AlreadyTerminal(Job),
    NotFound,
}

/// Registry of jobs owned by this subsystem. The terminal-guarded transition
/// is the primitive behind exactly-once batch completion: implementations
/// run the check-then-set under their own lock or transaction.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, job: &Job) -> Result<(), RegistryError>;
    async fn get(&self, id: &JobId) -> Result<Option<Job>, RegistryError>;
    async fn update(&self, job: &Job) -> Result<(), RegistryError>;
    async fn find_by_call_id(&self, call: &CallId) -> Result<Option<Job>, RegistryError>;
    async fn children_of(&self, batch: &BatchId) -> Result<Vec<Job>, RegistryError>;
    async fn transition_if_not_terminal(
        &self,
        id: &JobId,
        next: JobStatus,
        now_epoch_ms: u64,
    ) -> Result<TransitionOutcome, RegistryError>;
}

fn transition_in_place(job: &mut Job, next: JobStatus, now_epoch_ms: u64) -> TransitionOutcome {
    if job.status.is_terminal() {
        return TransitionOutcome::AlreadyTerminal(job.clone());
    }
    match job.apply_transition(next, now_epoch_ms) {
        Ok(()) => TransitionOutcome::Applied(job.clone()),
        // Non-terminal jobs accept every terminal move, so a table rejection
        // here means a lifecycle bug; surface it as already-terminal-like
        // no-op rather than corrupting state.
        Err(_) => TransitionOutcome::AlreadyTerminal(job.clone()),
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(RegistryError(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, RegistryError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.id) {
            return Err(RegistryError(format!("job {} not found", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn find_by_call_id(&self, call: &CallId) -> Result<Option<Job>, RegistryError> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .find(|j| j.external_call_id.as_ref() == Some(call))
            .cloned())
    }

    async fn children_of(&self, batch: &BatchId) -> Result<Vec<Job>, RegistryError> {
        let jobs = self.jobs.lock().await;
        let mut children: Vec<Job> = jobs
            .values()
            .filter(|j| j.kind.parent_batch() == Some(batch))
            .cloned()
            .collect();
        children.sort_by_key(|j| j.id.clone());
        Ok(children)
    }

    async fn transition_if_not_terminal(
        &self,
        id: &JobId,
        next: JobStatus,
        now_epoch_ms: u64,
    ) -> Result<TransitionOutcome, RegistryError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(job) => Ok(transition_in_place(job, next, now_epoch_ms)),
            None => Ok(TransitionOutcome::NotFound),
        }
    }
}

/// rusqlite-backed registry. The whole job is stored as a JSON document with
/// indexed columns for the lookups this subsystem performs.
pub struct SqliteJobStore {
    conn: Arc<StdMutex<Connection>>,
}

const JOBS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS job (
    job_id TEXT PRIMARY KEY,
    external_call_id TEXT,
    parent_batch TEXT,
    status TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS job_call_idx ON job (external_call_id);
CREATE INDEX IF NOT EXISTS job_batch_idx ON job (parent_batch);
";

impl SqliteJobStore {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| RegistryError(e.to_string()))?;
        conn.execute_batch(JOBS_SCHEMA)
            .map_err(|e| RegistryError(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory().map_err(|e| RegistryError(e.to_string()))?;
        conn.execute_batch(JOBS_SCHEMA)
            .map_err(|e| RegistryError(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RegistryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RegistryError("job connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RegistryError(e.to_string()))?
    }
}

fn job_from_body(body: &str) -> Result<Job, RegistryError> {
    serde_json::from_str(body).map_err(|e| RegistryError(format!("corrupt job body: {e}")))
}

fn upsert_row(conn: &Connection, job: &Job, replace: bool) -> Result<(), RegistryError> {
    let body = serde_json::to_string(job).map_err(|e| RegistryError(e.to_string()))?;
    let sql = if replace {
        "INSERT OR REPLACE INTO job (job_id, external_call_id, parent_batch, status, body)
         VALUES (?1, ?2, ?3, ?4, ?5)"
    } else {
        "INSERT INTO job (job_id, external_call_id, parent_batch, status, body)
         VALUES (?1, ?2, ?3, ?4, ?5)"
    };
    conn.execute(
        sql,
        params![
            job.id.as_str(),
            job.external_call_id.as_ref().map(CallId::as_str),
            job.kind.parent_batch().map(BatchId::as_str),
            job.status.as_str(),
            body
        ],
    )
    .map_err(|e| RegistryError(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<(), RegistryError> {
        let job = job.clone();
        self.with_conn(move |conn| upsert_row(conn, &job, false)).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, RegistryError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT body FROM job WHERE job_id = ?1",
                params![id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| RegistryError(e.to_string()))?
            .map(|body| job_from_body(&body))
            .transpose()
        })
        .await
    }

    async fn update(&self, job: &Job) -> Result<(), RegistryError> {
        let job = job.clone();
        self.with_conn(move |conn| upsert_row(conn, &job, true)).await
    }

    async fn find_by_call_id(&self, call: &CallId) -> Result<Option<Job>, RegistryError> {
        let call = call.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT body FROM job WHERE external_call_id = ?1",
                params![call.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| RegistryError(e.to_string()))?
            .map(|body| job_from_body(&body))
            .transpose()
        })
        .await
    }

    async fn children_of(&self, batch: &BatchId) -> Result<Vec<Job>, RegistryError> {
        let batch = batch.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM job WHERE parent_batch = ?1 ORDER BY job_id")
                .map_err(|e| RegistryError(e.to_string()))?;
            let rows = stmt
                .query_map(params![batch.as_str()], |row| row.get::<_, String>(0))
                .map_err(|e| RegistryError(e.to_string()))?;
            let mut out = Vec::new();
            for body in rows {
                let body = body.map_err(|e| RegistryError(e.to_string()))?;
                out.push(job_from_body(&body)?);
            }
            Ok(out)
        })
        .await
    }

    async fn transition_if_not_terminal(
        &self,
        id: &JobId,
        next: JobStatus,
        now_epoch_ms: u64,
    ) -> Result<TransitionOutcome, RegistryError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| RegistryError(e.to_string()))?;
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM job WHERE job_id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RegistryError(e.to_string()))?;
            let Some(body) = body else {
                return Ok(TransitionOutcome::NotFound);
            };
            let mut job = job_from_body(&body)?;
            let outcome = transition_in_place(&mut job, next, now_epoch_ms);
            if let TransitionOutcome::Applied(ref applied) = outcome {
                let body =
                    serde_json::to_string(applied).map_err(|e| RegistryError(e.to_string()))?;
                tx.execute(
                    "UPDATE job SET status = ?2, body = ?3 WHERE job_id = ?1",
                    params![applied.id.as_str(), applied.status.as_str(), body],
                )
                .map_err(|e| RegistryError(e.to_string()))?;
            }
            tx.commit().map_err(|e| RegistryError(e.to_string()))?;
            Ok(outcome)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldgate_model::{JobInput, JobKind, Lane, ResourceEstimate, UserId};

    fn job(id: &str, kind: JobKind) -> Job {
        Job::new(
            JobId::parse(id).expect("job id"),
            kind,
            Lane::Bulk,
            UserId::parse("u1").expect("user"),
            JobInput {
                protein_sequences: vec!["MKT".to_string()],
                ligands: Vec::new(),
                use_msa_server: false,
            },
            ResourceEstimate::default(),
            1,
        )
        .expect("job")
    }

    #[tokio::test]
    async fn sqlite_round_trips_jobs_and_call_ids() {
        let store = SqliteJobStore::open_in_memory().expect("open");
        let mut j = job("j-1", JobKind::Individual);
        store.insert(&j).await.expect("insert");
        j.external_call_id = Some(CallId::parse("call-1").expect("call"));
        store.update(&j).await.expect("update");
        let found = store
            .find_by_call_id(&CallId::parse("call-1").expect("call"))
            .await
            .expect("lookup");
        assert_eq!(found.map(|f| f.id), Some(j.id));
    }

    #[tokio::test]
    async fn sqlite_children_are_scoped_to_their_batch() {
        let store = SqliteJobStore::open_in_memory().expect("open");
        let batch = BatchId::parse("b-1").expect("batch");
        for i in 0..3 {
            store
                .insert(&job(
                    &format!("child-{i}"),
                    JobKind::BatchChild {
                        parent: batch.clone(),
                        index: i,
                    },
                ))
                .await
                .expect("insert");
        }
        store
            .insert(&job("stray", JobKind::Individual))
            .await
            .expect("insert");
        let children = store.children_of(&batch).await.expect("children");
        assert_eq!(children.len(), 3);
    }

    #[tokio::test]
    async fn terminal_guard_applies_exactly_once() {
        for store in [
            Box::new(InMemoryJobStore::default()) as Box<dyn JobStore>,
            Box::new(SqliteJobStore::open_in_memory().expect("open")),
        ] {
            let mut j = job("guarded", JobKind::Individual);
            j.apply_transition(JobStatus::Queued, 2).expect("queue");
            store.insert(&j).await.expect("insert");

            let first = store
                .transition_if_not_terminal(&j.id, JobStatus::Completed, 3)
                .await
                .expect("transition");
            assert!(matches!(first, TransitionOutcome::Applied(_)));
            let second = store
                .transition_if_not_terminal(&j.id, JobStatus::Completed, 4)
                .await
                .expect("transition");
            assert!(matches!(second, TransitionOutcome::AlreadyTerminal(_)));
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::default();
        let j = job("dup", JobKind::Individual);
        store.insert(&j).await.expect("insert");
        assert!(store.insert(&j).await.is_err());
    }
}
