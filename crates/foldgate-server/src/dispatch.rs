use async_trait::async_trait;
use foldgate_model::{CallId, Job, JobId};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError(pub String);

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// Hand-off to the external GPU executor. Fire-and-forget: the returned
/// call id is the correlation key for the completion webhook; this
/// subsystem never waits synchronously for the result.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, job: &Job) -> Result<CallId, DispatchError>;
}

/// Test and single-node double: records dispatched jobs and mints
/// sequential call ids.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<JobId>>,
    counter: AtomicU64,
    pub fail_all: bool,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: &Job) -> Result<CallId, DispatchError> {
        if self.fail_all {
            return Err(DispatchError("dispatch backend unavailable".to_string()));
        }
        self.dispatched.lock().await.push(job.id.clone());
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        CallId::parse(&format!("call-{}-{n}", job.id))
            .map_err(|e| DispatchError(e.to_string()))
    }
}
