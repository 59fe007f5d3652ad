// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ApiErrorCode {
    ValidationFailed,
    DailyQuotaExceeded,
    MonthlyQuotaExceeded,
    ConcurrentLimitExceeded,
    RateLimited,
    SystemOverloaded,
    InvalidSignature,
    StaleTimestamp,
    UnknownJob,
    JobNotFound,
    IllegalTransition,
    QueueFull,
    Internal,
}

impl ApiErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::DailyQuotaExceeded => "daily_quota_exceeded",
            Self::MonthlyQuotaExceeded => "monthly_quota_exceeded",
            Self::ConcurrentLimitExceeded => "concurrent_limit",
            Self::RateLimited => "rate_limited",
            Self::SystemOverloaded => "system_overloaded",
            Self::InvalidSignature => "invalid_signature",
            Self::StaleTimestamp => "stale_timestamp",
            Self::UnknownJob => "unknown_job",
            Self::JobNotFound => "job_not_found",
            Self::IllegalTransition => "illegal_transition",
            Self::QueueFull => "queue_full",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub details: Value,
    pub request_id: String,
}

impl ApiError {
    #[must_use]
    pub fn new(
        code: ApiErrorCode,
        message: impl Into<String>,
        details: Value,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            request_id: request_id.into(),
        }
    }

    #[must_use]
    pub fn validation_failed(reason: &str) -> Self {
        Self::new(
            ApiErrorCode::ValidationFailed,
            "validation failed",
            json!({"reason": reason}),
            "req-unknown",
        )
    }

    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            ApiErrorCode::RateLimited,
            "rate limit exceeded",
            json!({"retry_after_secs": retry_after_secs}),
            "req-unknown",
        )
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = request_id.to_string();
        self
    }
}
