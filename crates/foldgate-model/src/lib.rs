#![forbid(unsafe_code)]

pub mod batch;
pub mod estimate;
pub mod ids;
pub mod job;
pub mod quota;

pub use batch::{BatchAggregate, BatchFailurePolicy};
pub use estimate::ResourceEstimate;
pub use ids::{BatchId, CallId, JobId, UserId, ValidationError};
pub use job::{Job, JobInput, JobKind, JobStatus, Lane};
pub use quota::{QuotaTier, UserQuota};
