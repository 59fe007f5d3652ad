#![forbid(unsafe_code)]

pub mod error_mapping;
pub mod errors;
pub mod wire;

pub use error_mapping::map_error;
pub use errors::{ApiError, ApiErrorCode};
pub use wire::{
    AdmissionAccepted, CompletionEventWire, JobStatusResponse, QuotaUsageResponse,
    SubmitJobRequest, WebhookAck,
};

pub const API_VERSION: &str = "v1";
