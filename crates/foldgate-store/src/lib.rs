#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::fmt::{Display, Formatter};

pub mod local;
pub mod memory;
pub mod paths;
pub mod retry;
pub mod transaction;

pub use local::LocalFsStore;
pub use memory::InMemoryStore;
pub use paths::{ResultScope, BATCH_INDEX_FILE, METADATA_FILE, RESULTS_FILE, STRUCTURE_FILE};
pub use retry::RetryPolicy;
pub use transaction::{CommittedResult, OperationKind, OperationRecord, ResultTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreErrorCode {
    NotFound,
    Validation,
    FinalizeFailed,
    Conflict,
    Io,
    Internal,
}

impl StoreErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation_error",
            Self::FinalizeFailed => "finalize_failed",
            Self::Conflict => "conflict",
            Self::Io => "io_error",
            Self::Internal => "internal_error",
        }
    }

    /// Whether a whole-transaction retry can plausibly succeed.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Io)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for StoreError {}

/// The four operations the backing store collaborator provides. Each
/// individual operation is atomic (a move fully succeeds or fully fails);
/// nothing here is transactional across objects — that is what
/// [`ResultTransaction`] layers on top.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;
    async fn move_object(&self, src: &str, dst: &str) -> Result<(), StoreError>;
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;
    /// Deleting a missing object is a no-op, not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}
