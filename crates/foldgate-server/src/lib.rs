#![forbid(unsafe_code)]

use axum::routing::{get, post};
use axum::Router;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

pub mod cascade;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod estimator;
pub mod http;
pub mod load;
pub mod quota;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod worker;

pub use cascade::{CompletionCascade, CompletionEvent, EventDedupe, PermitTable};
pub use concurrency::{AdmitError, ConcurrencyManager, SlotPermit};
pub use config::{LaneConfig, OrchestratorConfig, RateLimitConfig};
pub use dispatch::{Dispatcher, RecordingDispatcher};
pub use load::{LoadProbe, NoopLoadProbe, StaticLoadProbe, SystemLoadMonitor};
pub use quota::{InMemoryQuotaStore, QuotaStore, SqliteQuotaStore};
pub use registry::{InMemoryJobStore, JobStore, SqliteJobStore};
pub use router::JobRouter;
pub use telemetry::metrics::OrchestratorMetrics;
pub use telemetry::rate_limiter::RateLimiter;
pub use telemetry::redis_backend::{RedisBackend, RedisPolicy};
pub use worker::CompletionQueue;

use foldgate_store::ObjectStore;

pub const CRATE_NAME: &str = "foldgate-server";

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<OrchestratorConfig>,
    pub router: Arc<JobRouter>,
    pub manager: Arc<ConcurrencyManager>,
    pub jobs: Arc<dyn JobStore>,
    pub quota: Arc<dyn QuotaStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub permits: Arc<PermitTable>,
    pub cascade: Arc<CompletionCascade>,
    pub queue: Arc<CompletionQueue>,
    pub metrics: Arc<OrchestratorMetrics>,
    pub limiter: Arc<RateLimiter>,
    pub request_id_seed: Arc<AtomicU64>,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    /// Wires every service from explicit collaborators; `main` calls this
    /// once, tests call it per case with in-memory stores. Spawns the
    /// completion worker pool, so a runtime must be active.
    #[must_use]
    pub fn with_config(
        cfg: OrchestratorConfig,
        jobs: Arc<dyn JobStore>,
        quota: Arc<dyn QuotaStore>,
        results: Arc<dyn ObjectStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let redis_policy = RedisPolicy {
            timeout: Duration::from_millis(cfg.redis_timeout_ms),
            retry_attempts: cfg.redis_retry_attempts.max(1),
            breaker_failure_threshold: cfg.redis_breaker_failure_threshold,
            breaker_open_duration: Duration::from_millis(cfg.redis_breaker_open_ms),
        };
        let redis_for = |enabled: bool| {
            if enabled {
                cfg.redis_url
                    .as_deref()
                    .and_then(|u| RedisBackend::new(u, &cfg.redis_prefix, redis_policy.clone()).ok())
            } else {
                None
            }
        };

        let metrics = Arc::new(OrchestratorMetrics::default());
        let limiter = Arc::new(RateLimiter::new(
            redis_for(cfg.enable_redis_rate_limit),
            "admission",
        ));
        let load: Arc<dyn LoadProbe> = if cfg.load_check_enabled {
            Arc::new(SystemLoadMonitor::new(
                cfg.cpu_shed_threshold_pct,
                cfg.memory_shed_threshold_pct,
                cfg.load_refresh_interval,
            ))
        } else {
            Arc::new(NoopLoadProbe)
        };
        let manager = ConcurrencyManager::new(&cfg, Arc::clone(&quota), Arc::clone(&limiter), load);
        let router = JobRouter::new(Arc::clone(&manager), cfg.lanes.clone());
        let permits = Arc::new(PermitTable::default());
        let dedupe = EventDedupe::new(
            redis_for(cfg.redis_url.is_some()),
            cfg.event_marker_ttl_secs,
        );
        let cascade = CompletionCascade::new(
            Arc::clone(&jobs),
            results,
            Arc::clone(&permits),
            dedupe,
            cfg.batch_failure_policy,
            cfg.aggregate_retry_attempts,
            Arc::clone(&metrics),
        );
        let queue = CompletionQueue::start(
            cfg.completion_queue_depth,
            cfg.completion_workers,
            Arc::clone(&cascade),
            Arc::clone(&metrics),
        );
        Self {
            cfg: Arc::new(cfg),
            router,
            manager,
            jobs,
            quota,
            dispatcher,
            permits,
            cascade,
            queue,
            metrics,
            limiter,
            request_id_seed: Arc::new(AtomicU64::new(1)),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(http::handlers::healthz_handler))
        .route("/readyz", get(http::handlers::readyz_handler))
        .route("/metrics", get(http::handlers::metrics_handler))
        .route("/v1/jobs", post(http::handlers::submit_job_handler))
        .route("/v1/jobs/:job_id", get(http::handlers::job_status_handler))
        .route(
            "/v1/jobs/:job_id/cancel",
            post(http::handlers::cancel_job_handler),
        )
        .route(
            "/v1/users/:user_id/quota",
            get(http::handlers::quota_usage_handler),
        )
        .route(
            "/v1/webhooks/completion",
            post(http::webhook::completion_webhook_handler),
        )
        .with_state(state)
}
