use foldgate_model::BatchFailurePolicy;
use serde::Serialize;
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30.0,
            refill_per_sec: 10.0,
        }
    }
}

impl RateLimitConfig {
    /// Bucket for a tier's per-minute admission allowance: a minute of burst
    /// capacity refilled continuously.
    #[must_use]
    pub fn from_requests_per_minute(rpm: f64) -> Self {
        Self {
            capacity: rpm.max(1.0),
            refill_per_sec: (rpm / 60.0).max(0.05),
        }
    }
}

/// Thresholds separating the interactive lane from bulk. A job qualifies for
/// interactive only when ligand count and estimated GPU seconds are both
/// under the hard thresholds; within the borderline fraction of either
/// threshold the requester's hint decides, defaulting to bulk.
#[derive(Debug, Clone, Serialize)]
pub struct LaneConfig {
    pub interactive_max_ligands: u32,
    pub interactive_max_gpu_seconds: f64,
    pub borderline_fraction: f64,
    pub interactive_capacity: usize,
    pub bulk_capacity: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            interactive_max_ligands: 4,
            interactive_max_gpu_seconds: 300.0,
            borderline_fraction: 0.8,
            interactive_capacity: 16,
            bulk_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorConfig {
    pub global_capacity: usize,
    pub semaphore_wait: Duration,
    pub lanes: LaneConfig,
    pub load_check_enabled: bool,
    pub cpu_shed_threshold_pct: f32,
    pub memory_shed_threshold_pct: f32,
    pub load_refresh_interval: Duration,
    pub webhook_secret: Option<String>,
    pub webhook_max_skew_secs: u64,
    pub completion_queue_depth: usize,
    pub completion_workers: usize,
    pub aggregate_retry_attempts: usize,
    pub batch_failure_policy: BatchFailurePolicy,
    pub event_marker_ttl_secs: usize,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub enable_redis_rate_limit: bool,
    pub redis_timeout_ms: u64,
    pub redis_retry_attempts: usize,
    pub redis_breaker_failure_threshold: u32,
    pub redis_breaker_open_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_capacity: 64,
            semaphore_wait: Duration::from_millis(250),
            lanes: LaneConfig::default(),
            load_check_enabled: false,
            cpu_shed_threshold_pct: 92.0,
            memory_shed_threshold_pct: 90.0,
            load_refresh_interval: Duration::from_millis(500),
            webhook_secret: None,
            webhook_max_skew_secs: 300,
            completion_queue_depth: 256,
            completion_workers: 4,
            aggregate_retry_attempts: 3,
            batch_failure_policy: BatchFailurePolicy::CompleteWithFailures,
            event_marker_ttl_secs: 86_400,
            redis_url: None,
            redis_prefix: "foldgate".to_string(),
            enable_redis_rate_limit: false,
            redis_timeout_ms: 50,
            redis_retry_attempts: 2,
            redis_breaker_failure_threshold: 8,
            redis_breaker_open_ms: 3000,
        }
    }
}

pub fn validate_startup_config_contract(cfg: &OrchestratorConfig) -> Result<(), String> {
    if cfg.global_capacity == 0 {
        return Err("global capacity must be > 0".to_string());
    }
    if cfg.semaphore_wait.is_zero() {
        return Err("semaphore wait must be > 0".to_string());
    }
    if cfg.lanes.interactive_max_gpu_seconds <= 0.0 {
        return Err("interactive gpu-seconds threshold must be > 0".to_string());
    }
    if !(0.0..=1.0).contains(&cfg.lanes.borderline_fraction) {
        return Err("borderline fraction must be within 0..=1".to_string());
    }
    if cfg.completion_queue_depth == 0 || cfg.completion_workers == 0 {
        return Err("completion queue depth and worker count must be > 0".to_string());
    }
    if cfg.webhook_max_skew_secs == 0 {
        return Err("webhook skew window must be > 0".to_string());
    }
    if cfg
        .webhook_secret
        .as_deref()
        .is_some_and(|s| s.trim().is_empty())
    {
        return Err("webhook_secret must be non-empty when set".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_config_validation_rejects_zero_capacity() {
        let cfg = OrchestratorConfig {
            global_capacity: 0,
            ..OrchestratorConfig::default()
        };
        let err = validate_startup_config_contract(&cfg).expect_err("zero capacity");
        assert!(err.contains("global capacity"));
    }

    #[test]
    fn startup_config_validation_rejects_blank_secret() {
        let cfg = OrchestratorConfig {
            webhook_secret: Some("   ".to_string()),
            ..OrchestratorConfig::default()
        };
        let err = validate_startup_config_contract(&cfg).expect_err("blank secret");
        assert!(err.contains("webhook_secret"));
    }

    #[test]
    fn rate_limit_from_rpm_refills_a_bucket_per_minute() {
        let cfg = RateLimitConfig::from_requests_per_minute(60.0);
        assert_eq!(cfg.capacity, 60.0);
        assert!((cfg.refill_per_sec - 1.0).abs() < 1e-9);
    }
}
