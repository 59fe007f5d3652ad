use crate::config::RateLimitConfig;
use crate::telemetry::redis_backend::RedisBackend;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter with an optional shared-store window. When the
/// shared store errors the check degrades to the process-local bucket;
/// degradation is counted every time but logged only once.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    redis: Option<RedisBackend>,
    scope: String,
    fallback_total: AtomicU64,
    fallback_logged: AtomicBool,
}

impl RateLimiter {
    #[must_use]
    pub fn new(redis: Option<RedisBackend>, scope: &str) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            redis,
            scope: scope.to_string(),
            fallback_total: AtomicU64::new(0),
            fallback_logged: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn fallback_total(&self) -> u64 {
        self.fallback_total.load(Ordering::Relaxed)
    }

    pub async fn allow(&self, key: &str, cfg: &RateLimitConfig) -> bool {
        if let Some(redis) = &self.redis {
            match redis.rate_limit_allow(&self.scope, key, cfg).await {
                Ok(v) => return v,
                Err(e) => {
                    self.fallback_total.fetch_add(1, Ordering::Relaxed);
                    if !self.fallback_logged.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            scope = %self.scope,
                            "shared-store rate limit degraded to local bucket: {e}"
                        );
                    }
                }
            }
        }
        let now = Instant::now();
        let mut lock = self.buckets.lock().await;
        let bucket = lock.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: cfg.capacity,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + (elapsed * cfg.refill_per_sec)).min(cfg.capacity);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
