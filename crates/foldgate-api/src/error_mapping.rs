// SPDX-License-Identifier: Apache-2.0

use crate::{ApiError, ApiErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiErrorMapping {
    pub status_code: u16,
}

#[must_use]
pub fn map_error(error: &ApiError) -> ApiErrorMapping {
    let status_code = match error.code {
        ApiErrorCode::ValidationFailed | ApiErrorCode::IllegalTransition => 400,
        ApiErrorCode::InvalidSignature | ApiErrorCode::StaleTimestamp => 401,
        ApiErrorCode::JobNotFound | ApiErrorCode::UnknownJob => 404,
        ApiErrorCode::DailyQuotaExceeded
        | ApiErrorCode::MonthlyQuotaExceeded
        | ApiErrorCode::ConcurrentLimitExceeded
        | ApiErrorCode::RateLimited => 429,
        ApiErrorCode::SystemOverloaded | ApiErrorCode::QueueFull => 503,
        ApiErrorCode::Internal => 500,
    };

    ApiErrorMapping { status_code }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quota_rejections_map_to_429() {
        for code in [
            ApiErrorCode::DailyQuotaExceeded,
            ApiErrorCode::MonthlyQuotaExceeded,
            ApiErrorCode::ConcurrentLimitExceeded,
            ApiErrorCode::RateLimited,
        ] {
            let err = ApiError::new(code, "limit", json!({}), "req-1");
            assert_eq!(map_error(&err).status_code, 429);
        }
    }

    #[test]
    fn webhook_auth_rejections_map_to_401() {
        for code in [ApiErrorCode::InvalidSignature, ApiErrorCode::StaleTimestamp] {
            let err = ApiError::new(code, "rejected", json!({}), "req-1");
            assert_eq!(map_error(&err).status_code, 401);
        }
    }
}
