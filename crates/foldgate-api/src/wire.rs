// SPDX-License-Identifier: Apache-2.0

use foldgate_model::{BatchAggregate, JobInput, Lane, ResourceEstimate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound admission request from the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitJobRequest {
    pub user_id: String,
    pub job_input: JobInput,
    #[serde(default)]
    pub lane_hint: Option<Lane>,
    /// Present when the request creates a batch: one child per entry.
    #[serde(default)]
    pub batch_inputs: Option<Vec<JobInput>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionAccepted {
    pub job_id: String,
    pub lane: Lane,
    pub estimate: ResourceEstimate,
}

/// Completion webhook body as sent by the external executor. `result` and
/// `error` stay opaque JSON; this subsystem persists them, never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEventWire {
    pub call_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CompletionEventWire {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookAck {
    pub status: String,
    pub call_id: String,
}

impl WebhookAck {
    #[must_use]
    pub fn accepted(call_id: &str) -> Self {
        Self {
            status: "accepted".to_string(),
            call_id: call_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub lane: Lane,
    #[serde(default)]
    pub batch: Option<BatchAggregate>,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaUsageResponse {
    pub user_id: String,
    pub tier: String,
    pub daily_gpu_minutes_limit: f64,
    pub used_daily_gpu_minutes: f64,
    pub monthly_gpu_minutes_limit: f64,
    pub used_monthly_gpu_minutes: f64,
    pub concurrent_jobs_limit: usize,
    pub active_jobs: u32,
    pub daily_resets_in_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_accepts_minimal_body() {
        let raw = r#"{"user_id":"u1","job_input":{"protein_sequences":["MKT"]}}"#;
        let req: SubmitJobRequest = serde_json::from_str(raw).expect("deserialize");
        assert!(req.lane_hint.is_none());
        assert!(!req.job_input.use_msa_server);
    }

    #[test]
    fn completion_event_tolerates_extra_fields() {
        // Executors add fields over time; the webhook body is not strict.
        let raw = r#"{"call_id":"c1","status":"success","result":{},"extra":1}"#;
        let ev: CompletionEventWire = serde_json::from_str(raw).expect("deserialize");
        assert!(ev.is_success());
    }

    #[test]
    fn lane_hint_parses_lowercase() {
        let raw = r#"{"user_id":"u1","job_input":{"protein_sequences":["MKT"]},"lane_hint":"bulk"}"#;
        let req: SubmitJobRequest = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(req.lane_hint, Some(Lane::Bulk));
    }
}
