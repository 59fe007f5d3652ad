use crate::cascade::CompletionEvent;
use crate::http::handlers::{api_error_response, next_request_id};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use foldgate_api::{ApiError, ApiErrorCode, CompletionEventWire, WebhookAck};
use foldgate_core::time::unix_seconds;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::sync::atomic::Ordering;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookError {
    InvalidSignature,
    StaleTimestamp,
}

impl WebhookError {
    const fn api_code(self) -> ApiErrorCode {
        match self {
            Self::InvalidSignature => ApiErrorCode::InvalidSignature,
            Self::StaleTimestamp => ApiErrorCode::StaleTimestamp,
        }
    }
}

/// HMAC-SHA256 over the raw payload, constant-time compare via the mac
/// itself, plus a bounded freshness window on the timestamp header.
pub fn verify_webhook(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
    max_skew_secs: u64,
    now_unix_secs: u64,
) -> Result<(), WebhookError> {
    let ts_raw = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::StaleTimestamp)?;
    let ts: u64 = ts_raw
        .trim()
        .parse()
        .map_err(|_| WebhookError::StaleTimestamp)?;
    if now_unix_secs.abs_diff(ts) > max_skew_secs {
        return Err(WebhookError::StaleTimestamp);
    }

    let sig_raw = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::InvalidSignature)?;
    let sig_hex = sig_raw
        .strip_prefix("sha256=")
        .ok_or(WebhookError::InvalidSignature)?;
    let sig_bytes = hex::decode(sig_hex).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&sig_bytes)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Helper for senders and tests: the signature header value for a payload.
#[must_use]
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// `POST /v1/webhooks/completion`. The 202 acknowledges intake only;
/// processing is asynchronous relative to this response.
pub async fn completion_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = next_request_id(&state);
    if let Some(secret) = &state.cfg.webhook_secret {
        if let Err(err) = verify_webhook(
            secret,
            &headers,
            &body,
            state.cfg.webhook_max_skew_secs,
            unix_seconds(),
        ) {
            state
                .metrics
                .webhook_rejected_total
                .fetch_add(1, Ordering::Relaxed);
            return api_error_response(ApiError::new(
                err.api_code(),
                "webhook rejected",
                json!({}),
                request_id,
            ));
        }
    }

    let wire: CompletionEventWire = match serde_json::from_slice(&body) {
        Ok(wire) => wire,
        Err(e) => {
            state
                .metrics
                .webhook_rejected_total
                .fetch_add(1, Ordering::Relaxed);
            return api_error_response(ApiError::new(
                ApiErrorCode::ValidationFailed,
                "malformed completion payload",
                json!({"reason": e.to_string()}),
                request_id,
            ));
        }
    };
    let call_id = wire.call_id.clone();
    let event = match CompletionEvent::from_wire(wire) {
        Ok(event) => event,
        Err(e) => {
            state
                .metrics
                .webhook_rejected_total
                .fetch_add(1, Ordering::Relaxed);
            return api_error_response(ApiError::new(
                ApiErrorCode::ValidationFailed,
                "invalid call id",
                json!({"reason": e.to_string()}),
                request_id,
            ));
        }
    };

    if state.queue.try_enqueue(event).is_err() {
        return api_error_response(ApiError::new(
            ApiErrorCode::QueueFull,
            "completion queue is full",
            json!({}),
            request_id,
        ));
    }
    state
        .metrics
        .webhook_accepted_total
        .fetch_add(1, Ordering::Relaxed);
    (StatusCode::ACCEPTED, Json(WebhookAck::accepted(&call_id))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_for(secret: &str, body: &[u8], ts: u64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign_payload(secret, body).parse().expect("header value"),
        );
        headers.insert(TIMESTAMP_HEADER, ts.to_string().parse().expect("header"));
        headers
    }

    #[test]
    fn fresh_valid_signature_verifies() {
        let body = br#"{"call_id":"c1","status":"success"}"#;
        let headers = headers_for("topsecret", body, 1_000);
        assert_eq!(verify_webhook("topsecret", &headers, body, 300, 1_100), Ok(()));
    }

    #[test]
    fn stale_timestamp_is_rejected_even_with_valid_signature() {
        let body = br#"{"call_id":"c1","status":"success"}"#;
        let headers = headers_for("topsecret", body, 1_000);
        assert_eq!(
            verify_webhook("topsecret", &headers, body, 300, 2_000),
            Err(WebhookError::StaleTimestamp)
        );
    }

    #[test]
    fn wrong_secret_fails_signature_check() {
        let body = br#"{"call_id":"c1","status":"success"}"#;
        let headers = headers_for("other-secret", body, 1_000);
        assert_eq!(
            verify_webhook("topsecret", &headers, body, 300, 1_000),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn any_mutated_payload_byte_invalidates_the_signature() {
        let body = br#"{"call_id":"c1","status":"success"}"#.to_vec();
        let headers = headers_for("topsecret", &body, 1_000);
        for i in 0..body.len() {
            let mut mutated = body.clone();
            mutated[i] ^= 0x01;
            assert_eq!(
                verify_webhook("topsecret", &headers, &mutated, 300, 1_000),
                Err(WebhookError::InvalidSignature),
                "mutation at byte {i} must invalidate"
            );
        }
    }

    #[test]
    fn missing_headers_are_rejected() {
        let body = b"{}";
        let headers = HeaderMap::new();
        assert_eq!(
            verify_webhook("topsecret", &headers, body, 300, 1_000),
            Err(WebhookError::StaleTimestamp)
        );
    }

    #[test]
    fn future_timestamps_outside_the_window_are_stale() {
        let body = b"{}";
        let headers = headers_for("topsecret", body, 10_000);
        assert_eq!(
            verify_webhook("topsecret", &headers, body, 300, 1_000),
            Err(WebhookError::StaleTimestamp)
        );
    }
}
