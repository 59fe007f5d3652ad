use crate::cascade::CascadeError;
use crate::concurrency::AdmitError;
use crate::router::Admission;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use foldgate_api::{
    map_error, AdmissionAccepted, ApiError, ApiErrorCode, JobStatusResponse, QuotaUsageResponse,
    SubmitJobRequest,
};
use foldgate_core::sha256_hex;
use foldgate_core::time::{seconds_until_next_day, unix_millis, unix_seconds};
use foldgate_model::{
    BatchAggregate, BatchId, Job, JobId, JobInput, JobKind, JobStatus, Lane, QuotaTier, UserId,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{error, info};

pub fn next_request_id(state: &AppState) -> String {
    format!(
        "req-{}",
        state.request_id_seed.fetch_add(1, Ordering::Relaxed)
    )
}

pub fn api_error_response(err: ApiError) -> Response {
    let status = StatusCode::from_u16(map_error(&err).status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

/// Typed admission rejection to the wire shape; every rejection names the
/// limit, current usage, and when it resets. Never a bare 500.
fn admit_error_to_api(err: &AdmitError, request_id: &str) -> ApiError {
    match err {
        AdmitError::RateLimited { retry_after_secs } => ApiError::new(
            ApiErrorCode::RateLimited,
            "admission rate limit exceeded",
            json!({"retry_after_secs": retry_after_secs}),
            request_id,
        ),
        AdmitError::DailyQuotaExceeded {
            used_gpu_minutes,
            limit_gpu_minutes,
            resets_in_secs,
        } => ApiError::new(
            ApiErrorCode::DailyQuotaExceeded,
            "daily GPU-minute quota exceeded",
            json!({
                "used_gpu_minutes": used_gpu_minutes,
                "limit_gpu_minutes": limit_gpu_minutes,
                "resets_in_secs": resets_in_secs,
            }),
            request_id,
        ),
        AdmitError::MonthlyQuotaExceeded {
            used_gpu_minutes,
            limit_gpu_minutes,
        } => ApiError::new(
            ApiErrorCode::MonthlyQuotaExceeded,
            "monthly GPU-minute quota exceeded",
            json!({
                "used_gpu_minutes": used_gpu_minutes,
                "limit_gpu_minutes": limit_gpu_minutes,
            }),
            request_id,
        ),
        AdmitError::ConcurrentLimitExceeded { active, limit } => ApiError::new(
            ApiErrorCode::ConcurrentLimitExceeded,
            "concurrent job limit reached",
            json!({"active_jobs": active, "limit": limit}),
            request_id,
        ),
        AdmitError::SystemOverloaded { reason } => ApiError::new(
            ApiErrorCode::SystemOverloaded,
            "system is shedding load",
            json!({"reason": reason}),
            request_id,
        ),
        AdmitError::Internal(_) => ApiError::new(
            ApiErrorCode::Internal,
            "admission failed",
            json!({}),
            request_id,
        ),
    }
}

fn mint_job_id(state: &AppState, user: &UserId) -> JobId {
    let seq = state.request_id_seed.fetch_add(1, Ordering::Relaxed);
    let digest = sha256_hex(format!("{user}:{}:{seq}", unix_millis()).as_bytes());
    JobId::parse(&format!("job-{}", &digest[..16])).expect("minted id is within charset")
}

async fn dispatch_job(state: &AppState, job: &mut Job) -> Result<(), CascadeError> {
    match state.dispatcher.dispatch(job).await {
        Ok(call_id) => {
            job.external_call_id = Some(call_id);
            job.apply_transition(JobStatus::Queued, unix_millis() as u64)
                .map_err(|e| CascadeError::Internal(e.to_string()))?;
            state
                .jobs
                .update(job)
                .await
                .map_err(|e| CascadeError::Registry(e.to_string()))?;
            Ok(())
        }
        Err(e) => {
            error!(job = %job.id, "dispatch failed: {e}");
            job.apply_transition(JobStatus::Failed, unix_millis() as u64)
                .map_err(|err| CascadeError::Internal(err.to_string()))?;
            state
                .jobs
                .update(job)
                .await
                .map_err(|err| CascadeError::Registry(err.to_string()))?;
            Err(CascadeError::Internal(e.to_string()))
        }
    }
}

pub async fn submit_job_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Response {
    let request_id = next_request_id(&state);
    let user = match UserId::parse(&req.user_id) {
        Ok(user) => user,
        Err(e) => {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(&request_id),
            )
        }
    };

    match &req.batch_inputs {
        Some(children) if !children.is_empty() => {
            submit_batch(&state, &request_id, &user, children, req.lane_hint).await
        }
        Some(_) => api_error_response(
            ApiError::validation_failed("batch_inputs must not be empty")
                .with_request_id(&request_id),
        ),
        None => submit_single(&state, &request_id, &user, &req.job_input, req.lane_hint).await,
    }
}

async fn submit_single(
    state: &AppState,
    request_id: &str,
    user: &UserId,
    input: &JobInput,
    lane_hint: Option<Lane>,
) -> Response {
    if let Err(e) = input.validate_strict() {
        return api_error_response(
            ApiError::validation_failed(&e.to_string()).with_request_id(request_id),
        );
    }
    let admission = match state.router.route(user, input, lane_hint).await {
        Ok(admission) => admission,
        Err(err) => {
            state.metrics.observe_rejection(err.reason_code()).await;
            return api_error_response(admit_error_to_api(&err, request_id));
        }
    };

    let job_id = mint_job_id(state, user);
    let job = match Job::new(
        job_id,
        JobKind::Individual,
        admission.lane,
        user.clone(),
        input.clone(),
        admission.estimate.clone(),
        unix_millis() as u64,
    ) {
        Ok(job) => job,
        Err(e) => {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(request_id),
            )
        }
    };
    finish_submission(state, request_id, job, admission).await
}

async fn finish_submission(
    state: &AppState,
    request_id: &str,
    mut job: Job,
    admission: Admission,
) -> Response {
    if let Err(e) = state.jobs.insert(&job).await {
        error!(job = %job.id, "registry insert failed: {e}");
        return api_error_response(ApiError::new(
            ApiErrorCode::Internal,
            "failed to record job",
            json!({}),
            request_id,
        ));
    }
    state
        .permits
        .insert(job.id.clone(), admission.permit)
        .await;

    if dispatch_job(state, &mut job).await.is_err() {
        if let Some(permit) = state.permits.take(&job.id).await {
            permit.settle(None).await;
        }
        return api_error_response(ApiError::new(
            ApiErrorCode::Internal,
            "job dispatch failed",
            json!({}),
            request_id,
        ));
    }

    state
        .metrics
        .admissions_total
        .fetch_add(1, Ordering::Relaxed);
    info!(job = %job.id, lane = job.lane.as_str(), "job admitted");
    (
        StatusCode::ACCEPTED,
        Json(AdmissionAccepted {
            job_id: job.id.to_string(),
            lane: job.lane,
            estimate: job.estimate.clone(),
        }),
    )
        .into_response()
}

async fn submit_batch(
    state: &AppState,
    request_id: &str,
    user: &UserId,
    children: &[JobInput],
    lane_hint: Option<Lane>,
) -> Response {
    for input in children {
        if let Err(e) = input.validate_strict() {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(request_id),
            );
        }
    }
    let (admission, child_estimates) =
        match state.router.route_batch(user, children, lane_hint).await {
            Ok(ok) => ok,
            Err(err) => {
                state.metrics.observe_rejection(err.reason_code()).await;
                return api_error_response(admit_error_to_api(&err, request_id));
            }
        };

    let parent_id = mint_job_id(state, user);
    let batch_id = BatchId::parse(parent_id.as_str()).expect("job ids share the batch charset");
    let parent = match Job::new(
        parent_id.clone(),
        JobKind::BatchParent {
            child_count: children.len() as u32,
        },
        admission.lane,
        user.clone(),
        // Representative input; the parent itself is never dispatched.
        children[0].clone(),
        admission.estimate.clone(),
        unix_millis() as u64,
    ) {
        Ok(parent) => parent,
        Err(e) => {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(request_id),
            )
        }
    };
    if let Err(e) = state.jobs.insert(&parent).await {
        error!(job = %parent.id, "registry insert failed: {e}");
        return api_error_response(ApiError::new(
            ApiErrorCode::Internal,
            "failed to record batch",
            json!({}),
            request_id,
        ));
    }
    state
        .permits
        .insert(parent.id.clone(), admission.permit)
        .await;

    let mut any_dispatched = false;
    for (index, (input, estimate)) in children.iter().zip(child_estimates).enumerate() {
        let child_id = JobId::parse(&format!("{parent_id}-c{index}"))
            .expect("child suffix stays within charset");
        let mut child = match Job::new(
            child_id,
            JobKind::BatchChild {
                parent: batch_id.clone(),
                index: index as u32,
            },
            admission.lane,
            user.clone(),
            input.clone(),
            estimate,
            unix_millis() as u64,
        ) {
            Ok(child) => child,
            Err(e) => {
                return api_error_response(
                    ApiError::validation_failed(&e.to_string()).with_request_id(request_id),
                )
            }
        };
        if let Err(e) = state.jobs.insert(&child).await {
            error!(job = %child.id, "registry insert failed: {e}");
            continue;
        }
        if dispatch_job(state, &mut child).await.is_ok() {
            any_dispatched = true;
        }
    }

    let mut parent = parent;
    let next = if any_dispatched {
        JobStatus::Queued
    } else {
        JobStatus::Cancelled
    };
    if parent.apply_transition(next, unix_millis() as u64).is_ok() {
        let _ = state.jobs.update(&parent).await;
    }
    if !any_dispatched {
        // Nothing will ever call back; settle the batch slot now.
        if let Some(permit) = state.permits.take(&parent.id).await {
            permit.settle(None).await;
        }
        return api_error_response(ApiError::new(
            ApiErrorCode::Internal,
            "no batch children could be dispatched",
            json!({}),
            request_id,
        ));
    }
    // Children that failed dispatch synchronously already count toward the
    // aggregate; fold them in so the batch can still complete.
    if let Err(e) = state.cascade.recompute_batch(&batch_id).await {
        error!(batch = %batch_id, "initial aggregate write failed: {e}");
    }

    state
        .metrics
        .admissions_total
        .fetch_add(1, Ordering::Relaxed);
    info!(job = %parent.id, children = children.len(), "batch admitted");
    (
        StatusCode::ACCEPTED,
        Json(AdmissionAccepted {
            job_id: parent.id.to_string(),
            lane: parent.lane,
            estimate: parent.estimate.clone(),
        }),
    )
        .into_response()
}

pub async fn job_status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let request_id = next_request_id(&state);
    let id = match JobId::parse(&job_id) {
        Ok(id) => id,
        Err(e) => {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(&request_id),
            )
        }
    };
    let job = match state.jobs.get(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            return api_error_response(ApiError::new(
                ApiErrorCode::JobNotFound,
                "job not found",
                json!({"job_id": job_id}),
                request_id,
            ))
        }
        Err(e) => {
            error!(job = %job_id, "registry read failed: {e}");
            return api_error_response(ApiError::new(
                ApiErrorCode::Internal,
                "registry unavailable",
                json!({}),
                request_id,
            ));
        }
    };

    let mut batch: Option<BatchAggregate> = None;
    let mut progress = None;
    if matches!(job.kind, JobKind::BatchParent { .. }) {
        if let Ok(batch_id) = BatchId::parse(job.id.as_str()) {
            if let Ok(children) = state.jobs.children_of(&batch_id).await {
                let statuses: Vec<JobStatus> = children.iter().map(|c| c.status).collect();
                let agg = BatchAggregate::from_child_statuses(&statuses);
                progress = Some(agg.progress());
                batch = Some(agg);
            }
        }
    }
    Json(JobStatusResponse {
        job_id: job.id.to_string(),
        status: job.status.as_str().to_string(),
        lane: job.lane,
        batch,
        progress,
    })
    .into_response()
}

pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let request_id = next_request_id(&state);
    let id = match JobId::parse(&job_id) {
        Ok(id) => id,
        Err(e) => {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(&request_id),
            )
        }
    };
    match state
        .jobs
        .transition_if_not_terminal(&id, JobStatus::Cancelled, unix_millis() as u64)
        .await
    {
        Ok(crate::registry::TransitionOutcome::Applied(job)) => {
            state
                .metrics
                .cancellations_total
                .fetch_add(1, Ordering::Relaxed);
            // Release the slot now; a completion event arriving later hits
            // the terminal no-op path.
            if let Some(permit) = state.permits.take(&id).await {
                permit.settle(None).await;
            }
            if let JobKind::BatchChild { parent, .. } = &job.kind {
                if let Err(e) = state.cascade.recompute_batch(parent).await {
                    error!(batch = %parent, "aggregate update after cancel failed: {e}");
                }
            }
            Json(json!({"job_id": job_id, "status": JobStatus::Cancelled.as_str()}))
                .into_response()
        }
        Ok(crate::registry::TransitionOutcome::AlreadyTerminal(job)) => {
            Json(json!({"job_id": job_id, "status": job.status.as_str()})).into_response()
        }
        Ok(crate::registry::TransitionOutcome::NotFound) => api_error_response(ApiError::new(
            ApiErrorCode::JobNotFound,
            "job not found",
            json!({"job_id": job_id}),
            request_id,
        )),
        Err(e) => {
            error!(job = %job_id, "cancel failed: {e}");
            api_error_response(ApiError::new(
                ApiErrorCode::Internal,
                "cancel failed",
                json!({}),
                request_id,
            ))
        }
    }
}

pub async fn quota_usage_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let request_id = next_request_id(&state);
    let user = match UserId::parse(&user_id) {
        Ok(user) => user,
        Err(e) => {
            return api_error_response(
                ApiError::validation_failed(&e.to_string()).with_request_id(&request_id),
            )
        }
    };
    match state.quota.get_or_create(&user, QuotaTier::default()).await {
        Ok(quota) => Json(QuotaUsageResponse {
            user_id: quota.user_id.to_string(),
            tier: quota.tier.as_str().to_string(),
            daily_gpu_minutes_limit: quota.tier.daily_gpu_minutes_limit(),
            used_daily_gpu_minutes: quota.used_daily_gpu_minutes,
            monthly_gpu_minutes_limit: quota.tier.monthly_gpu_minutes_limit(),
            used_monthly_gpu_minutes: quota.used_monthly_gpu_minutes,
            concurrent_jobs_limit: quota.tier.concurrent_jobs_limit(),
            active_jobs: quota.active_jobs,
            daily_resets_in_secs: seconds_until_next_day(unix_seconds()),
        })
        .into_response(),
        Err(e) => {
            error!(user = %user_id, "quota read failed: {e}");
            api_error_response(ApiError::new(
                ApiErrorCode::Internal,
                "quota store unavailable",
                json!({}),
                request_id,
            ))
        }
    }
}

pub async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

pub async fn readyz_handler(State(state): State<AppState>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        Json(json!({"status": "ready"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready"})),
        )
            .into_response()
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut text = state.metrics.render().await;
    text.push_str(&format!(
        "foldgate_rate_limit_fallback_total {}\n",
        state.limiter.fallback_total()
    ));
    text.into_response()
}
