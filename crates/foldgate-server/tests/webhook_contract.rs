// SPDX-License-Identifier: Apache-2.0

mod support;

use foldgate_core::time::unix_seconds;
use foldgate_model::JobStatus;
use foldgate_server::http::webhook::sign_payload;
use foldgate_server::{build_router, OrchestratorConfig};
use std::time::Duration;
use support::{harness, small_input, submit};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SECRET: &str = "wh-secret-1";

async fn send_post(
    addr: std::net::SocketAddr,
    path: &str,
    body: &[u8],
    extra_headers: &[(String, String)],
) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect server");
    let mut req = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await.expect("write head");
    stream.write_all(body).await.expect("write body");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    let (head, payload) = response
        .split_once("\r\n\r\n")
        .expect("http response separator");
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .expect("http status");
    (status, payload.to_string())
}

fn signed_headers(body: &[u8], ts: u64) -> Vec<(String, String)> {
    vec![
        ("X-Signature".to_string(), sign_payload(SECRET, body)),
        ("X-Timestamp".to_string(), ts.to_string()),
    ]
}

fn webhook_state() -> support::TestHarness {
    harness(OrchestratorConfig {
        webhook_secret: Some(SECRET.to_string()),
        ..OrchestratorConfig::default()
    })
}

async fn serve(state: foldgate_server::AppState) -> std::net::SocketAddr {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move { axum::serve(listener, app).await.expect("serve app") });
    addr
}

#[tokio::test]
async fn valid_webhook_is_accepted_with_202() {
    let h = webhook_state();
    let (_, submitted) = submit(&h.state, "hook-user", small_input(), None).await;
    let job_id = submitted["job_id"].as_str().expect("job id").to_string();
    let call = support::call_id_of(&h.state, &job_id).await;
    let addr = serve(h.state.clone()).await;

    let body = serde_json::to_vec(&serde_json::json!({
        "call_id": call.as_str(),
        "status": "success",
        "result": {"affinity": -6.1},
        "metadata": {"gpu_seconds": 20.0},
    }))
    .expect("body");
    let (status, payload) =
        send_post(addr, "/v1/webhooks/completion", &body, &signed_headers(&body, unix_seconds()))
            .await;
    assert_eq!(status, 202);
    let ack: serde_json::Value = serde_json::from_str(&payload).expect("ack json");
    assert_eq!(ack["status"], "accepted");
    assert_eq!(ack["call_id"], call.as_str());

    // Processing is asynchronous relative to the 202; poll briefly.
    let id = foldgate_model::JobId::parse(&job_id).expect("id");
    let mut completed = false;
    for _ in 0..50 {
        let job = h.state.jobs.get(&id).await.expect("read").expect("present");
        if job.status == JobStatus::Completed {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed, "completion should be processed asynchronously");
}

#[tokio::test]
async fn wrong_signature_is_rejected_401_with_no_side_effects() {
    let h = webhook_state();
    let (_, submitted) = submit(&h.state, "hook-user2", small_input(), None).await;
    let job_id = submitted["job_id"].as_str().expect("job id").to_string();
    let call = support::call_id_of(&h.state, &job_id).await;
    let addr = serve(h.state.clone()).await;

    let body = serde_json::to_vec(&serde_json::json!({
        "call_id": call.as_str(),
        "status": "success",
    }))
    .expect("body");
    let headers = vec![
        (
            "X-Signature".to_string(),
            "sha256=deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
        ),
        ("X-Timestamp".to_string(), unix_seconds().to_string()),
    ];
    let (status, payload) = send_post(addr, "/v1/webhooks/completion", &body, &headers).await;
    assert_eq!(status, 401);
    let err: serde_json::Value = serde_json::from_str(&payload).expect("error json");
    assert_eq!(err["code"], "invalid_signature");

    let id = foldgate_model::JobId::parse(&job_id).expect("id");
    let job = h.state.jobs.get(&id).await.expect("read").expect("present");
    assert_eq!(job.status, JobStatus::Queued, "no processing on rejection");
}

#[tokio::test]
async fn stale_timestamp_is_rejected_401() {
    let h = webhook_state();
    let addr = serve(h.state.clone()).await;
    let body = br#"{"call_id":"call-x-1","status":"success"}"#.to_vec();
    let stale_ts = unix_seconds() - 3_600;
    let (status, payload) =
        send_post(addr, "/v1/webhooks/completion", &body, &signed_headers(&body, stale_ts)).await;
    assert_eq!(status, 401);
    let err: serde_json::Value = serde_json::from_str(&payload).expect("error json");
    assert_eq!(err["code"], "stale_timestamp");
}

#[tokio::test]
async fn tampered_body_fails_the_signature_check() {
    let h = webhook_state();
    let addr = serve(h.state.clone()).await;
    let body = br#"{"call_id":"call-x-2","status":"success"}"#.to_vec();
    let headers = signed_headers(&body, unix_seconds());
    let mut tampered = body.clone();
    let idx = tampered.len() - 3;
    tampered[idx] ^= 0x20;
    let (status, _) = send_post(addr, "/v1/webhooks/completion", &tampered, &headers).await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn unknown_call_id_still_gets_202_at_the_boundary() {
    // Resolution happens downstream; the sender only learns about intake.
    let h = webhook_state();
    let addr = serve(h.state.clone()).await;
    let body = br#"{"call_id":"call-unknown-9","status":"failure","error":{"kind":"timeout"}}"#
        .to_vec();
    let (status, _) =
        send_post(addr, "/v1/webhooks/completion", &body, &signed_headers(&body, unix_seconds()))
            .await;
    assert_eq!(status, 202);
}

#[tokio::test]
async fn malformed_json_body_is_a_400() {
    let h = webhook_state();
    let addr = serve(h.state.clone()).await;
    let body = b"{not json".to_vec();
    let (status, _) =
        send_post(addr, "/v1/webhooks/completion", &body, &signed_headers(&body, unix_seconds()))
            .await;
    assert_eq!(status, 400);
}
