// SPDX-License-Identifier: Apache-2.0

use crate::ids::UserId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    #[default]
    Free,
    Standard,
    Priority,
}

impl QuotaTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Priority => "priority",
        }
    }

    #[must_use]
    pub const fn daily_gpu_minutes_limit(self) -> f64 {
        match self {
            Self::Free => 60.0,
            Self::Standard => 480.0,
            Self::Priority => 2_880.0,
        }
    }

    #[must_use]
    pub const fn monthly_gpu_minutes_limit(self) -> f64 {
        match self {
            Self::Free => 600.0,
            Self::Standard => 7_200.0,
            Self::Priority => 43_200.0,
        }
    }

    #[must_use]
    pub const fn concurrent_jobs_limit(self) -> usize {
        match self {
            Self::Free => 2,
            Self::Standard => 8,
            Self::Priority => 32,
        }
    }

    /// Admission requests per minute; feeds the token bucket refill rate.
    #[must_use]
    pub const fn requests_per_minute(self) -> f64 {
        match self {
            Self::Free => 10.0,
            Self::Standard => 60.0,
            Self::Priority => 240.0,
        }
    }
}

/// Persisted per-user counters; the quota store is the single source of
/// quota truth, semaphores are only a fast-path cache of admitted counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserQuota {
    pub user_id: UserId,
    pub tier: QuotaTier,
    pub used_daily_gpu_minutes: f64,
    pub used_monthly_gpu_minutes: f64,
    pub active_jobs: u32,
    pub day_bucket: u64,
    pub month_bucket: u64,
}

impl UserQuota {
    #[must_use]
    pub fn new(user_id: UserId, tier: QuotaTier, day_bucket: u64, month_bucket: u64) -> Self {
        Self {
            user_id,
            tier,
            used_daily_gpu_minutes: 0.0,
            used_monthly_gpu_minutes: 0.0,
            active_jobs: 0,
            day_bucket,
            month_bucket,
        }
    }

    /// Zeroes any window whose epoch bucket has rolled over since last access.
    pub fn reset_if_epoch_elapsed(&mut self, day_bucket: u64, month_bucket: u64) {
        if day_bucket != self.day_bucket {
            self.used_daily_gpu_minutes = 0.0;
            self.day_bucket = day_bucket;
        }
        if month_bucket != self.month_bucket {
            self.used_monthly_gpu_minutes = 0.0;
            self.month_bucket = month_bucket;
        }
    }

    /// Whether a reservation of `gpu_minutes` fits both windows.
    #[must_use]
    pub fn fits(&self, gpu_minutes: f64) -> QuotaFit {
        if self.used_daily_gpu_minutes + gpu_minutes > self.tier.daily_gpu_minutes_limit() {
            return QuotaFit::DailyExceeded;
        }
        if self.used_monthly_gpu_minutes + gpu_minutes > self.tier.monthly_gpu_minutes_limit() {
            return QuotaFit::MonthlyExceeded;
        }
        QuotaFit::Fits
    }

    pub fn reserve(&mut self, gpu_minutes: f64) {
        self.used_daily_gpu_minutes += gpu_minutes;
        self.used_monthly_gpu_minutes += gpu_minutes;
        self.active_jobs += 1;
    }

    /// Reverses a reservation, optionally replacing the estimate with the
    /// actual minutes consumed.
    pub fn release(&mut self, reserved_gpu_minutes: f64, actual_gpu_minutes: Option<f64>) {
        let delta = match actual_gpu_minutes {
            Some(actual) => actual - reserved_gpu_minutes,
            None => -reserved_gpu_minutes,
        };
        self.used_daily_gpu_minutes = (self.used_daily_gpu_minutes + delta).max(0.0);
        self.used_monthly_gpu_minutes = (self.used_monthly_gpu_minutes + delta).max(0.0);
        self.active_jobs = self.active_jobs.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaFit {
    Fits,
    DailyExceeded,
    MonthlyExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;

    fn quota(tier: QuotaTier) -> UserQuota {
        UserQuota::new(UserId::parse("u1").expect("user"), tier, 100, 50)
    }

    #[test]
    fn reservation_counts_against_both_windows() {
        let mut q = quota(QuotaTier::Free);
        q.reserve(10.0);
        assert_eq!(q.used_daily_gpu_minutes, 10.0);
        assert_eq!(q.used_monthly_gpu_minutes, 10.0);
        assert_eq!(q.active_jobs, 1);
    }

    #[test]
    fn daily_window_rejects_before_monthly() {
        let mut q = quota(QuotaTier::Free);
        q.used_daily_gpu_minutes = 55.0;
        assert_eq!(q.fits(10.0), QuotaFit::DailyExceeded);
    }

    #[test]
    fn exact_limit_fill_is_allowed() {
        let q = quota(QuotaTier::Free);
        assert_eq!(q.fits(60.0), QuotaFit::Fits);
        let mut q = q;
        q.reserve(60.0);
        assert_eq!(q.fits(0.1), QuotaFit::DailyExceeded);
    }

    #[test]
    fn epoch_rollover_resets_only_the_elapsed_window() {
        let mut q = quota(QuotaTier::Standard);
        q.reserve(30.0);
        q.reset_if_epoch_elapsed(101, 50);
        assert_eq!(q.used_daily_gpu_minutes, 0.0);
        assert_eq!(q.used_monthly_gpu_minutes, 30.0);
    }

    #[test]
    fn settle_with_actual_replaces_the_estimate() {
        let mut q = quota(QuotaTier::Standard);
        q.reserve(10.0);
        q.release(10.0, Some(4.0));
        assert_eq!(q.used_daily_gpu_minutes, 4.0);
        assert_eq!(q.active_jobs, 0);
    }

    #[test]
    fn release_without_actual_reverses_the_reservation() {
        let mut q = quota(QuotaTier::Standard);
        q.reserve(10.0);
        q.release(10.0, None);
        assert_eq!(q.used_daily_gpu_minutes, 0.0);
        assert_eq!(q.used_monthly_gpu_minutes, 0.0);
    }
}
