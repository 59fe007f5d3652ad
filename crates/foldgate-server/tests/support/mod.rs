// SPDX-License-Identifier: Apache-2.0
#![allow(dead_code)]

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use foldgate_model::{CallId, JobId, JobInput, Lane};
use foldgate_server::cascade::CompletionEvent;
use foldgate_server::http::handlers::submit_job_handler;
use foldgate_server::{
    AppState, Dispatcher, InMemoryJobStore, InMemoryQuotaStore, JobStore, OrchestratorConfig,
    QuotaStore, RecordingDispatcher,
};
use foldgate_store::{InMemoryStore, ObjectStore};
use serde_json::Value;
use std::sync::Arc;

pub struct TestHarness {
    pub state: AppState,
    pub results: Arc<InMemoryStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

pub fn harness(cfg: OrchestratorConfig) -> TestHarness {
    let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::default());
    let quota: Arc<dyn QuotaStore> = Arc::new(InMemoryQuotaStore::default());
    let results = Arc::new(InMemoryStore::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let state = AppState::with_config(
        cfg,
        jobs,
        quota,
        Arc::clone(&results) as Arc<dyn ObjectStore>,
        Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
    );
    TestHarness {
        state,
        results,
        dispatcher,
    }
}

pub fn small_input() -> JobInput {
    JobInput {
        protein_sequences: vec!["MKTAYIAKQRQISFVK".to_string()],
        ligands: vec!["CCO".to_string()],
        use_msa_server: false,
    }
}

pub fn sized_input(residues: usize) -> JobInput {
    JobInput {
        protein_sequences: vec!["M".repeat(residues)],
        ligands: vec!["CCO".to_string()],
        use_msa_server: false,
    }
}

pub async fn response_json(response: Response) -> (u16, Value) {
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

pub async fn submit(
    state: &AppState,
    user_id: &str,
    input: JobInput,
    lane_hint: Option<Lane>,
) -> (u16, Value) {
    let req = foldgate_api::SubmitJobRequest {
        user_id: user_id.to_string(),
        job_input: input,
        lane_hint,
        batch_inputs: None,
    };
    let response = submit_job_handler(State(state.clone()), Json(req)).await;
    response_json(response).await
}

pub async fn submit_batch(
    state: &AppState,
    user_id: &str,
    children: Vec<JobInput>,
) -> (u16, Value) {
    let req = foldgate_api::SubmitJobRequest {
        user_id: user_id.to_string(),
        job_input: children[0].clone(),
        lane_hint: None,
        batch_inputs: Some(children),
    };
    let response = submit_job_handler(State(state.clone()), Json(req)).await;
    response_json(response).await
}

pub async fn call_id_of(state: &AppState, job_id: &str) -> CallId {
    let id = JobId::parse(job_id).expect("job id");
    state
        .jobs
        .get(&id)
        .await
        .expect("registry read")
        .expect("job present")
        .external_call_id
        .expect("job was dispatched")
}

pub fn success_event(call_id: &CallId) -> CompletionEvent {
    CompletionEvent {
        event_id: call_id.as_str().to_string(),
        call_id: call_id.clone(),
        success: true,
        result: Some(serde_json::json!({"affinity": -7.4})),
        error: None,
        metadata: Some(serde_json::json!({"gpu_seconds": 33.0})),
    }
}

pub fn failure_event(call_id: &CallId) -> CompletionEvent {
    CompletionEvent {
        event_id: call_id.as_str().to_string(),
        call_id: call_id.clone(),
        success: false,
        result: None,
        error: Some(serde_json::json!({"kind": "oom", "message": "gpu out of memory"})),
        metadata: None,
    }
}
