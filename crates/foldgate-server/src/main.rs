#![forbid(unsafe_code)]

use async_trait::async_trait;
use foldgate_model::{BatchFailurePolicy, CallId, Job};
use foldgate_server::{
    build_router, config::validate_startup_config_contract, AppState, Dispatcher, JobStore,
    LaneConfig, OrchestratorConfig, QuotaStore, SqliteJobStore, SqliteQuotaStore,
};
use foldgate_store::{LocalFsStore, ObjectStore};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_duration_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(name, default_ms))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("FOLDGATE_LOG_JSON", true) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Placeholder for the concrete executor client, which is wired in by the
/// deployment (Cloud Run / Cloud Tasks live outside this subsystem). Mints
/// correlation ids and logs the hand-off.
struct LoggingDispatcher {
    counter: AtomicU64,
}

#[async_trait]
impl Dispatcher for LoggingDispatcher {
    async fn dispatch(
        &self,
        job: &Job,
    ) -> Result<CallId, foldgate_server::dispatch::DispatchError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!(job = %job.id, lane = job.lane.as_str(), "dispatching to executor");
        CallId::parse(&format!("call-{}-{n}", job.id))
            .map_err(|e| foldgate_server::dispatch::DispatchError(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    init_tracing();

    let bind_addr = env::var("FOLDGATE_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let data_dir = PathBuf::from(
        env::var("FOLDGATE_DATA_DIR").unwrap_or_else(|_| "artifacts/foldgate-data".to_string()),
    );
    let results_root = PathBuf::from(
        env::var("FOLDGATE_RESULTS_ROOT")
            .unwrap_or_else(|_| "artifacts/foldgate-results".to_string()),
    );
    std::fs::create_dir_all(&data_dir).map_err(|e| format!("create data dir failed: {e}"))?;
    std::fs::create_dir_all(&results_root)
        .map_err(|e| format!("create results root failed: {e}"))?;

    let cfg = OrchestratorConfig {
        global_capacity: env_usize("FOLDGATE_GLOBAL_CAPACITY", 64),
        semaphore_wait: env_duration_ms("FOLDGATE_SEMAPHORE_WAIT_MS", 250),
        lanes: LaneConfig {
            interactive_max_ligands: env_u64("FOLDGATE_INTERACTIVE_MAX_LIGANDS", 4) as u32,
            interactive_max_gpu_seconds: env_f64("FOLDGATE_INTERACTIVE_MAX_GPU_SECONDS", 300.0),
            borderline_fraction: env_f64("FOLDGATE_BORDERLINE_FRACTION", 0.8),
            interactive_capacity: env_usize("FOLDGATE_INTERACTIVE_CAPACITY", 16),
            bulk_capacity: env_usize("FOLDGATE_BULK_CAPACITY", 64),
        },
        load_check_enabled: env_bool("FOLDGATE_LOAD_CHECK_ENABLED", true),
        cpu_shed_threshold_pct: env_f32("FOLDGATE_CPU_SHED_THRESHOLD_PCT", 92.0),
        memory_shed_threshold_pct: env_f32("FOLDGATE_MEMORY_SHED_THRESHOLD_PCT", 90.0),
        load_refresh_interval: env_duration_ms("FOLDGATE_LOAD_REFRESH_MS", 500),
        webhook_secret: env::var("FOLDGATE_WEBHOOK_SECRET").ok(),
        webhook_max_skew_secs: env_u64("FOLDGATE_WEBHOOK_MAX_SKEW_SECS", 300),
        completion_queue_depth: env_usize("FOLDGATE_COMPLETION_QUEUE_DEPTH", 256),
        completion_workers: env_usize("FOLDGATE_COMPLETION_WORKERS", 4),
        aggregate_retry_attempts: env_usize("FOLDGATE_AGGREGATE_RETRY_ATTEMPTS", 3),
        batch_failure_policy: if env_bool("FOLDGATE_BATCH_FAIL_FAST", false) {
            BatchFailurePolicy::FailFast
        } else {
            BatchFailurePolicy::CompleteWithFailures
        },
        event_marker_ttl_secs: env_usize("FOLDGATE_EVENT_MARKER_TTL_SECS", 86_400),
        redis_url: env::var("FOLDGATE_REDIS_URL").ok(),
        redis_prefix: env::var("FOLDGATE_REDIS_PREFIX").unwrap_or_else(|_| "foldgate".to_string()),
        enable_redis_rate_limit: env_bool("FOLDGATE_ENABLE_REDIS_RATE_LIMIT", false),
        redis_timeout_ms: env_u64("FOLDGATE_REDIS_TIMEOUT_MS", 50),
        redis_retry_attempts: env_usize("FOLDGATE_REDIS_RETRY_ATTEMPTS", 2),
        redis_breaker_failure_threshold: env_u64("FOLDGATE_REDIS_BREAKER_FAILURE_THRESHOLD", 8)
            as u32,
        redis_breaker_open_ms: env_u64("FOLDGATE_REDIS_BREAKER_OPEN_MS", 3000),
    };
    validate_startup_config_contract(&cfg)?;

    let jobs: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(&data_dir.join("jobs.sqlite")).map_err(|e| e.to_string())?,
    );
    let quota: Arc<dyn QuotaStore> = Arc::new(
        SqliteQuotaStore::open(&data_dir.join("quota.sqlite")).map_err(|e| e.to_string())?,
    );
    let results: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(results_root));
    let dispatcher = Arc::new(LoggingDispatcher {
        counter: AtomicU64::new(0),
    });

    let state = AppState::with_config(cfg, jobs, quota, results, dispatcher);

    // The semaphores are a fast-path cache of admitted counts; rebuild them
    // from quota truth before accepting traffic.
    match state.manager.reconcile_from_quota_store().await {
        Ok(active) if active > 0 => info!("reconciled {active} active admissions from quota store"),
        Ok(_) => {}
        Err(e) => return Err(format!("startup reconciliation failed: {e}")),
    }

    let app = build_router(state);
    let addr: std::net::SocketAddr = bind_addr
        .parse()
        .map_err(|e| format!("invalid bind addr {bind_addr}: {e}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!("foldgate-server listening on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            let drain_ms = env_u64("FOLDGATE_SHUTDOWN_DRAIN_MS", 5000);
            tokio::time::sleep(Duration::from_millis(drain_ms)).await;
        })
        .await
        .map_err(|e| format!("server failed: {e}"))
}
