use crate::config::RateLimitConfig;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Clone, Debug)]
pub struct RedisPolicy {
    pub timeout: Duration,
    pub retry_attempts: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_open_duration: Duration,
}

impl Default for RedisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(50),
            retry_attempts: 2,
            breaker_failure_threshold: 8,
            breaker_open_duration: Duration::from_millis(3000),
        }
    }
}

#[derive(Default)]
struct RedisBreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
}

#[derive(Default)]
pub struct RedisMetrics {
    pub rate_limit_fallbacks: AtomicU64,
    pub marker_fallbacks: AtomicU64,
    pub breaker_open_total: AtomicU64,
    pub breaker_reject_total: AtomicU64,
}

/// Shared-store backend for cross-instance rate limiting and event dedupe
/// markers, behind a circuit breaker so a sick Redis degrades to local-only
/// behavior instead of blocking admission.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    policy: RedisPolicy,
    breaker: Arc<Mutex<RedisBreakerState>>,
    pub metrics: Arc<RedisMetrics>,
}

impl RedisBackend {
    pub fn new(url: &str, prefix: &str, policy: RedisPolicy) -> Result<Self, String> {
        let client = redis::Client::open(url).map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            policy,
            breaker: Arc::new(Mutex::new(RedisBreakerState::default())),
            metrics: Arc::new(RedisMetrics::default()),
        })
    }

    async fn breaker_check(&self) -> Result<(), String> {
        let lock = self.breaker.lock().await;
        if let Some(until) = lock.open_until {
            if Instant::now() < until {
                self.metrics
                    .breaker_reject_total
                    .fetch_add(1, Ordering::Relaxed);
                return Err("redis breaker open".to_string());
            }
        }
        Ok(())
    }

    async fn record_failure(&self, fallback_counter: &AtomicU64, msg: &str) -> String {
        fallback_counter.fetch_add(1, Ordering::Relaxed);
        let mut lock = self.breaker.lock().await;
        lock.failure_count += 1;
        if lock.failure_count >= self.policy.breaker_failure_threshold {
            lock.open_until = Some(Instant::now() + self.policy.breaker_open_duration);
            self.metrics
                .breaker_open_total
                .fetch_add(1, Ordering::Relaxed);
        }
        msg.to_string()
    }

    async fn record_success(&self) {
        let mut lock = self.breaker.lock().await;
        lock.failure_count = 0;
        lock.open_until = None;
    }

    async fn with_retry<T, Fut, F>(&self, mut op: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let attempts = self.policy.retry_attempts.max(1);
        let mut last = None;
        for i in 0..attempts {
            match timeout(self.policy.timeout, op()).await {
                Ok(Ok(v)) => return Ok(v),
                Ok(Err(e)) => last = Some(e),
                Err(_) => last = Some("redis timeout".to_string()),
            }
            if i + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Err(last.unwrap_or_else(|| "redis failure".to_string()))
    }

    /// Fixed-window admission counter shared across orchestrator instances.
    pub async fn rate_limit_allow(
        &self,
        scope: &str,
        key: &str,
        cfg: &RateLimitConfig,
    ) -> Result<bool, String> {
        self.breaker_check().await?;
        let minute = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| e.to_string())?
            .as_secs()
            / 60;
        let window_key = format!("{}:rl:{scope}:{key}:{minute}", self.prefix);
        let cap = cfg.capacity.ceil().max(1.0) as i64;
        let this = self.clone();
        let result = self
            .with_retry(move || {
                let this = this.clone();
                let window_key = window_key.clone();
                async move {
                    let mut conn = this
                        .client
                        .get_multiplexed_async_connection()
                        .await
                        .map_err(|e| e.to_string())?;
                    let count: i64 = conn
                        .incr(&window_key, 1_i64)
                        .await
                        .map_err(|e| e.to_string())?;
                    let _: bool = conn
                        .expire(&window_key, 120_i64)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(count <= cap)
                }
            })
            .await;
        match result {
            Ok(v) => {
                self.record_success().await;
                Ok(v)
            }
            Err(e) => Err(self
                .record_failure(&self.metrics.rate_limit_fallbacks, &e)
                .await),
        }
    }

    /// SET NX dedupe marker: `Ok(true)` when this call claimed the id first.
    pub async fn mark_event_if_new(
        &self,
        event_id: &str,
        ttl_secs: usize,
    ) -> Result<bool, String> {
        self.breaker_check().await?;
        let marker_key = format!("{}:event:{event_id}", self.prefix);
        let ttl = ttl_secs.max(1) as u64;
        let this = self.clone();
        let result = self
            .with_retry(move || {
                let this = this.clone();
                let marker_key = marker_key.clone();
                async move {
                    let mut conn = this
                        .client
                        .get_multiplexed_async_connection()
                        .await
                        .map_err(|e| e.to_string())?;
                    let set: bool = redis::cmd("SET")
                        .arg(&marker_key)
                        .arg(1_i64)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl)
                        .query_async(&mut conn)
                        .await
                        .map(|v: Option<String>| v.is_some())
                        .map_err(|e| e.to_string())?;
                    Ok(set)
                }
            })
            .await;
        match result {
            Ok(v) => {
                self.record_success().await;
                Ok(v)
            }
            Err(e) => Err(self
                .record_failure(&self.metrics.marker_fallbacks, &e)
                .await),
        }
    }

    pub async fn unmark_event(&self, event_id: &str) -> Result<(), String> {
        self.breaker_check().await?;
        let marker_key = format!("{}:event:{event_id}", self.prefix);
        let this = self.clone();
        let result = self
            .with_retry(move || {
                let this = this.clone();
                let marker_key = marker_key.clone();
                async move {
                    let mut conn = this
                        .client
                        .get_multiplexed_async_connection()
                        .await
                        .map_err(|e| e.to_string())?;
                    let _: i64 = conn.del(&marker_key).await.map_err(|e| e.to_string())?;
                    Ok(())
                }
            })
            .await;
        match result {
            Ok(()) => {
                self.record_success().await;
                Ok(())
            }
            Err(e) => Err(self
                .record_failure(&self.metrics.marker_fallbacks, &e)
                .await),
        }
    }
}
