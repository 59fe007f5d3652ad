use crate::config::{OrchestratorConfig, RateLimitConfig};
use crate::load::LoadProbe;
use crate::quota::{QuotaStore, ReserveOutcome};
use crate::telemetry::rate_limiter::RateLimiter;
use foldgate_core::time::{seconds_until_next_day, unix_seconds};
use foldgate_model::{Lane, QuotaTier, ResourceEstimate, UserId, UserQuota};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::warn;

/// Typed admission rejection; every variant carries enough for an
/// actionable user-facing message.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitError {
    RateLimited {
        retry_after_secs: u64,
    },
    DailyQuotaExceeded {
        used_gpu_minutes: f64,
        limit_gpu_minutes: f64,
        resets_in_secs: u64,
    },
    MonthlyQuotaExceeded {
        used_gpu_minutes: f64,
        limit_gpu_minutes: f64,
    },
    ConcurrentLimitExceeded {
        active: u32,
        limit: usize,
    },
    SystemOverloaded {
        reason: String,
    },
    Internal(String),
}

impl AdmitError {
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::DailyQuotaExceeded { .. } => "daily_quota_exceeded",
            Self::MonthlyQuotaExceeded { .. } => "monthly_quota_exceeded",
            Self::ConcurrentLimitExceeded { .. } => "concurrent_limit",
            Self::SystemOverloaded { .. } => "system_overloaded",
            Self::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry in ~{retry_after_secs}s")
            }
            Self::DailyQuotaExceeded {
                used_gpu_minutes,
                limit_gpu_minutes,
                resets_in_secs,
            } => write!(
                f,
                "daily GPU quota exceeded ({used_gpu_minutes:.1}/{limit_gpu_minutes:.1} min, resets in {resets_in_secs}s)"
            ),
            Self::MonthlyQuotaExceeded {
                used_gpu_minutes,
                limit_gpu_minutes,
            } => write!(
                f,
                "monthly GPU quota exceeded ({used_gpu_minutes:.1}/{limit_gpu_minutes:.1} min)"
            ),
            Self::ConcurrentLimitExceeded { active, limit } => {
                write!(f, "concurrent job limit reached ({active}/{limit})")
            }
            Self::SystemOverloaded { reason } => write!(f, "system overloaded: {reason}"),
            Self::Internal(msg) => write!(f, "admission failed: {msg}"),
        }
    }
}

impl std::error::Error for AdmitError {}

/// RAII admission slot. Holds the per-user and global permits plus the
/// optimistic quota reservation; consuming it via [`SlotPermit::settle`]
/// reconciles the reservation with actual usage. Dropping an unsettled
/// permit releases the semaphores immediately and reverses the reservation
/// in a spawned task, so release happens exactly once either way.
pub struct SlotPermit {
    user: UserId,
    lane: Lane,
    reserved_gpu_minutes: f64,
    quota: Arc<dyn QuotaStore>,
    user_permit: Option<OwnedSemaphorePermit>,
    global_permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("user", &self.user)
            .field("lane", &self.lane)
            .field("reserved_gpu_minutes", &self.reserved_gpu_minutes)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl SlotPermit {
    #[must_use]
    pub fn lane(&self) -> Lane {
        self.lane
    }

    #[must_use]
    pub fn reserved_gpu_minutes(&self) -> f64 {
        self.reserved_gpu_minutes
    }

    pub async fn settle(mut self, actual_gpu_minutes: Option<f64>) {
        self.settled = true;
        let user_permit = self.user_permit.take();
        let global_permit = self.global_permit.take();
        if let Err(e) = self
            .quota
            .settle(&self.user, self.reserved_gpu_minutes, actual_gpu_minutes)
            .await
        {
            warn!(user = %self.user, "quota settle failed: {e}");
        }
        drop(user_permit);
        drop(global_permit);
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Semaphore permits release on drop; the quota reservation reversal
        // needs async, so hand it to the runtime when one is present.
        let quota = Arc::clone(&self.quota);
        let user = self.user.clone();
        let reserved = self.reserved_gpu_minutes;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = quota.settle(&user, reserved, None).await {
                    warn!(user = %user, "quota reversal on drop failed: {e}");
                }
            });
        }
    }
}

/// Enforces, in order: rate limit, GPU-minute quota reservation, host load,
/// per-user concurrency, global capacity. Admission is all-or-nothing: any
/// failure after the reservation rolls it back before returning.
pub struct ConcurrencyManager {
    quota: Arc<dyn QuotaStore>,
    limiter: Arc<RateLimiter>,
    load: Arc<dyn LoadProbe>,
    global: Arc<Semaphore>,
    user_semaphores: Mutex<HashMap<UserId, Arc<Semaphore>>>,
    semaphore_wait: Duration,
    default_tier: QuotaTier,
}

impl ConcurrencyManager {
    #[must_use]
    pub fn new(
        cfg: &OrchestratorConfig,
        quota: Arc<dyn QuotaStore>,
        limiter: Arc<RateLimiter>,
        load: Arc<dyn LoadProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            quota,
            limiter,
            load,
            global: Arc::new(Semaphore::new(cfg.global_capacity)),
            user_semaphores: Mutex::new(HashMap::new()),
            semaphore_wait: cfg.semaphore_wait,
            default_tier: QuotaTier::default(),
        })
    }

    async fn user_semaphore(&self, user: &UserId, limit: usize) -> Arc<Semaphore> {
        let mut map = self.user_semaphores.lock().await;
        Arc::clone(
            map.entry(user.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1)))),
        )
    }

    pub async fn acquire_slot(
        &self,
        user: &UserId,
        lane: Lane,
        estimate: &ResourceEstimate,
    ) -> Result<SlotPermit, AdmitError> {
        let quota = self
            .quota
            .get_or_create(user, self.default_tier)
            .await
            .map_err(|e| AdmitError::Internal(e.to_string()))?;

        // Cheapest check first: no token, no further store work.
        let rate_cfg = RateLimitConfig::from_requests_per_minute(quota.tier.requests_per_minute());
        if !self.limiter.allow(user.as_str(), &rate_cfg).await {
            let retry_after_secs = (1.0 / rate_cfg.refill_per_sec).ceil() as u64;
            return Err(AdmitError::RateLimited { retry_after_secs });
        }

        // Optimistic reservation: increment now so concurrent admissions for
        // the same user cannot both slip under the limit.
        let gpu_minutes = estimate.gpu_minutes();
        let reserved = match self
            .quota
            .reserve(user, self.default_tier, gpu_minutes)
            .await
            .map_err(|e| AdmitError::Internal(e.to_string()))?
        {
            ReserveOutcome::Reserved(q) => q,
            ReserveOutcome::DailyExceeded(q) => {
                return Err(AdmitError::DailyQuotaExceeded {
                    used_gpu_minutes: q.used_daily_gpu_minutes,
                    limit_gpu_minutes: q.tier.daily_gpu_minutes_limit(),
                    resets_in_secs: seconds_until_next_day(unix_seconds()),
                });
            }
            ReserveOutcome::MonthlyExceeded(q) => {
                return Err(AdmitError::MonthlyQuotaExceeded {
                    used_gpu_minutes: q.used_monthly_gpu_minutes,
                    limit_gpu_minutes: q.tier.monthly_gpu_minutes_limit(),
                });
            }
        };

        // From here on every failure must reverse the reservation.
        if let Some(reason) = self.load.overloaded() {
            self.rollback_reservation(user, gpu_minutes).await;
            return Err(AdmitError::SystemOverloaded { reason });
        }

        let user_sem = self
            .user_semaphore(user, reserved.tier.concurrent_jobs_limit())
            .await;
        let user_permit = match timeout(self.semaphore_wait, user_sem.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                self.rollback_reservation(user, gpu_minutes).await;
                return Err(AdmitError::ConcurrentLimitExceeded {
                    active: reserved.active_jobs.saturating_sub(1),
                    limit: reserved.tier.concurrent_jobs_limit(),
                });
            }
        };

        let global_permit =
            match timeout(self.semaphore_wait, Arc::clone(&self.global).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => {
                    drop(user_permit);
                    self.rollback_reservation(user, gpu_minutes).await;
                    return Err(AdmitError::SystemOverloaded {
                        reason: "global capacity exhausted".to_string(),
                    });
                }
            };

        Ok(SlotPermit {
            user: user.clone(),
            lane,
            reserved_gpu_minutes: gpu_minutes,
            quota: Arc::clone(&self.quota),
            user_permit: Some(user_permit),
            global_permit: Some(global_permit),
            settled: false,
        })
    }

    async fn rollback_reservation(&self, user: &UserId, gpu_minutes: f64) {
        if let Err(e) = self.quota.settle(user, gpu_minutes, None).await {
            warn!(user = %user, "reservation rollback failed: {e}");
        }
    }

    /// Rebuilds the in-process fast path from quota truth after a restart:
    /// permits held by still-active jobs are forgotten so capacity
    /// accounting matches the store.
    pub async fn reconcile_from_quota_store(&self) -> Result<u32, AdmitError> {
        let active_users = self
            .quota
            .list_active()
            .await
            .map_err(|e| AdmitError::Internal(e.to_string()))?;
        let mut total_active = 0u32;
        for UserQuota {
            user_id,
            tier,
            active_jobs,
            ..
        } in active_users
        {
            let sem = self.user_semaphore(&user_id, tier.concurrent_jobs_limit()).await;
            sem.forget_permits(active_jobs as usize);
            total_active += active_jobs;
        }
        self.global.forget_permits(total_active as usize);
        Ok(total_active)
    }

    #[must_use]
    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }
}
