// SPDX-License-Identifier: Apache-2.0

mod support;

use foldgate_model::{BatchFailurePolicy, JobId, JobStatus, QuotaTier, UserId};
use foldgate_server::cascade::CascadeOutcome;
use foldgate_server::OrchestratorConfig;
use foldgate_store::ObjectStore;
use std::sync::atomic::Ordering;
use support::{failure_event, harness, small_input, submit, submit_batch, success_event};

#[tokio::test]
async fn completion_commits_results_and_settles_the_slot() {
    let h = harness(OrchestratorConfig::default());
    let (status, body) = submit(&h.state, "alice", small_input(), None).await;
    assert_eq!(status, 202);
    let job_id = body["job_id"].as_str().expect("job id").to_string();
    let call = support::call_id_of(&h.state, &job_id).await;

    let outcome = h
        .state
        .cascade
        .process(&success_event(&call))
        .await
        .expect("process");
    assert_eq!(outcome, CascadeOutcome::Processed { batch_done: false });

    let job = h
        .state
        .jobs
        .get(&JobId::parse(&job_id).expect("id"))
        .await
        .expect("read")
        .expect("present");
    assert_eq!(job.status, JobStatus::Completed);

    // Result and metadata are both visible under the individual layout.
    let files = h.results.list_prefix(&format!("jobs/{job_id}/")).await;
    assert!(files.contains(&format!("jobs/{job_id}/results.json")));
    assert!(files.contains(&format!("jobs/{job_id}/metadata.json")));

    // The slot settled with actual usage from event metadata (33 gpu-secs).
    let quota = h
        .state
        .quota
        .get_or_create(&UserId::parse("alice").expect("user"), QuotaTier::Free)
        .await
        .expect("quota");
    assert_eq!(quota.active_jobs, 0);
    assert!((quota.used_daily_gpu_minutes - 33.0 / 60.0).abs() < 1e-9);
}

#[tokio::test]
async fn duplicate_completion_event_is_a_noop() {
    let h = harness(OrchestratorConfig::default());
    let (_, body) = submit(&h.state, "bob", small_input(), None).await;
    let job_id = body["job_id"].as_str().expect("job id").to_string();
    let call = support::call_id_of(&h.state, &job_id).await;

    let first = h
        .state
        .cascade
        .process(&success_event(&call))
        .await
        .expect("first");
    assert_eq!(first, CascadeOutcome::Processed { batch_done: false });
    let files_after_first = h.results.list_prefix("jobs/").await;
    let quota_after_first = h
        .state
        .quota
        .get_or_create(&UserId::parse("bob").expect("user"), QuotaTier::Free)
        .await
        .expect("quota");

    let second = h
        .state
        .cascade
        .process(&success_event(&call))
        .await
        .expect("second");
    assert_eq!(second, CascadeOutcome::Duplicate);

    // Identical observable state: storage, job status, quota counters.
    assert_eq!(h.results.list_prefix("jobs/").await, files_after_first);
    let quota_after_second = h
        .state
        .quota
        .get_or_create(&UserId::parse("bob").expect("user"), QuotaTier::Free)
        .await
        .expect("quota");
    assert_eq!(quota_after_second, quota_after_first);
    assert_eq!(
        h.state.metrics.events_duplicate_total.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn unknown_call_id_is_dropped_without_side_effects() {
    let h = harness(OrchestratorConfig::default());
    let call = foldgate_model::CallId::parse("call-nobody-1").expect("call");
    let outcome = h
        .state
        .cascade
        .process(&success_event(&call))
        .await
        .expect("process");
    assert_eq!(outcome, CascadeOutcome::UnknownJob);
    assert!(h.results.list_prefix("jobs/").await.is_empty());
    assert_eq!(
        h.state
            .metrics
            .events_unknown_job_total
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn batch_of_three_with_one_failure_completes_with_aggregate() {
    let h = harness(OrchestratorConfig::default());
    let (status, body) =
        submit_batch(&h.state, "carol", vec![small_input(), small_input(), small_input()]).await;
    assert_eq!(status, 202);
    let parent_id = body["job_id"].as_str().expect("parent id").to_string();

    // Children complete out of index order; the third fails.
    let c1 = support::call_id_of(&h.state, &format!("{parent_id}-c1")).await;
    let c0 = support::call_id_of(&h.state, &format!("{parent_id}-c0")).await;
    let c2 = support::call_id_of(&h.state, &format!("{parent_id}-c2")).await;
    h.state.cascade.process(&success_event(&c1)).await.expect("c1");
    h.state.cascade.process(&success_event(&c0)).await.expect("c0");
    let last = h
        .state
        .cascade
        .process(&failure_event(&c2))
        .await
        .expect("c2");
    assert_eq!(last, CascadeOutcome::Processed { batch_done: true });

    // Default policy: the parent completes, failures stay visible.
    let parent = h
        .state
        .jobs
        .get(&JobId::parse(&parent_id).expect("id"))
        .await
        .expect("read")
        .expect("present");
    assert_eq!(parent.status, JobStatus::Completed);

    let index = h
        .results
        .get(&format!("batches/{parent_id}/batch_index.json"))
        .await
        .expect("aggregate committed");
    let doc: serde_json::Value = serde_json::from_slice(&index).expect("json");
    assert_eq!(doc["total"], 3);
    assert_eq!(doc["completed"], 2);
    assert_eq!(doc["failed"], 1);
    assert_eq!(doc["progress"], 1.0);

    // The failed child's failure payload is queryable from storage.
    let failed = h
        .results
        .get(&format!("batches/{parent_id}/jobs/{parent_id}-c2/results.json"))
        .await
        .expect("failure record committed");
    let failed_doc: serde_json::Value = serde_json::from_slice(&failed).expect("json");
    assert_eq!(failed_doc["status"], "failed");
    assert_eq!(failed_doc["error"]["kind"], "oom");
}

#[tokio::test]
async fn fail_fast_policy_fails_the_parent() {
    let cfg = OrchestratorConfig {
        batch_failure_policy: BatchFailurePolicy::FailFast,
        ..OrchestratorConfig::default()
    };
    let h = harness(cfg);
    let (_, body) = submit_batch(&h.state, "dave", vec![small_input(), small_input()]).await;
    let parent_id = body["job_id"].as_str().expect("parent id").to_string();

    let c0 = support::call_id_of(&h.state, &format!("{parent_id}-c0")).await;
    let c1 = support::call_id_of(&h.state, &format!("{parent_id}-c1")).await;
    h.state.cascade.process(&success_event(&c0)).await.expect("c0");
    h.state.cascade.process(&failure_event(&c1)).await.expect("c1");

    let parent = h
        .state
        .jobs
        .get(&JobId::parse(&parent_id).expect("id"))
        .await
        .expect("read")
        .expect("present");
    assert_eq!(parent.status, JobStatus::Failed);
}

#[tokio::test]
async fn concurrent_children_trigger_exactly_one_parent_completion() {
    // The batch completion race: every child independently checks "am I the
    // last one"; the terminal guard must let exactly one transition win,
    // regardless of arrival order.
    for _ in 0..8 {
        let h = harness(OrchestratorConfig::default());
        let children = vec![small_input(), small_input(), small_input(), small_input()];
        let (_, body) = submit_batch(&h.state, "erin", children).await;
        let parent_id = body["job_id"].as_str().expect("parent id").to_string();

        let mut calls = Vec::new();
        for i in 0..4 {
            calls.push(support::call_id_of(&h.state, &format!("{parent_id}-c{i}")).await);
        }
        let mut handles = Vec::new();
        for call in calls {
            let cascade = h.state.cascade.clone();
            handles.push(tokio::spawn(async move {
                cascade.process(&support::success_event(&call)).await
            }));
        }
        let mut batch_done_count = 0;
        for handle in handles {
            match handle.await.expect("join").expect("process") {
                CascadeOutcome::Processed { batch_done: true } => batch_done_count += 1,
                CascadeOutcome::Processed { batch_done: false } => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(batch_done_count, 1, "exactly one child finalizes the batch");
        assert_eq!(
            h.state
                .metrics
                .batch_completions_total
                .load(Ordering::Relaxed),
            1
        );

        let parent = h
            .state
            .jobs
            .get(&JobId::parse(&parent_id).expect("id"))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(parent.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn poll_sourced_events_flow_through_the_same_cascade() {
    let h = harness(OrchestratorConfig::default());
    let (_, body) = submit(&h.state, "poller", small_input(), None).await;
    let job_id = body["job_id"].as_str().expect("job id").to_string();
    let call = support::call_id_of(&h.state, &job_id).await;

    let event = foldgate_server::cascade::CompletionEvent::from_poll(
        call.clone(),
        true,
        Some(serde_json::json!({"affinity": -5.0})),
        None,
        None,
    );
    let outcome = h.state.cascade.process(&event).await.expect("process");
    assert_eq!(outcome, CascadeOutcome::Processed { batch_done: false });

    // A webhook retry for the same call id is now a duplicate.
    let dup = h
        .state
        .cascade
        .process(&success_event(&call))
        .await
        .expect("duplicate");
    assert_eq!(dup, CascadeOutcome::Duplicate);
}

#[tokio::test]
async fn completion_after_cancellation_is_a_terminal_noop() {
    let h = harness(OrchestratorConfig::default());
    let (_, body) = submit(&h.state, "frank", small_input(), None).await;
    let job_id = body["job_id"].as_str().expect("job id").to_string();
    let call = support::call_id_of(&h.state, &job_id).await;

    let response = foldgate_server::http::handlers::cancel_job_handler(
        axum::extract::State(h.state.clone()),
        axum::extract::Path(job_id.clone()),
    )
    .await;
    let (cancel_status, _) = support::response_json(response).await;
    assert_eq!(cancel_status, 200);

    let outcome = h
        .state
        .cascade
        .process(&success_event(&call))
        .await
        .expect("process");
    assert_eq!(outcome, CascadeOutcome::AlreadyTerminal);

    let job = h
        .state
        .jobs
        .get(&JobId::parse(&job_id).expect("id"))
        .await
        .expect("read")
        .expect("present");
    assert_eq!(job.status, JobStatus::Cancelled);
}
