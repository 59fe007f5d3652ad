use async_trait::async_trait;
use foldgate_core::time::{day_bucket, month_bucket, unix_seconds};
use foldgate_model::{QuotaTier, UserId, UserQuota};
use foldgate_model::quota::QuotaFit;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStoreError(pub String);

impl Display for QuotaStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for QuotaStoreError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved(UserQuota),
    DailyExceeded(UserQuota),
    MonthlyExceeded(UserQuota),
}

/// Persisted per-user counters; the single source of quota truth. Reserve is
/// atomic check-then-increment so concurrent admissions for one user cannot
/// both slip through; epoch windows reset lazily at access time.
#[async_trait]
pub trait QuotaStore: Send + Sync + 'static {
    async fn get_or_create(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
    ) -> Result<UserQuota, QuotaStoreError>;

    async fn reserve(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
        gpu_minutes: f64,
    ) -> Result<ReserveOutcome, QuotaStoreError>;

    /// Reverses a reservation; with `actual_gpu_minutes` the optimistic
    /// estimate is replaced by real usage.
    async fn settle(
        &self,
        user: &UserId,
        reserved_gpu_minutes: f64,
        actual_gpu_minutes: Option<f64>,
    ) -> Result<(), QuotaStoreError>;

    async fn set_tier(&self, user: &UserId, tier: QuotaTier) -> Result<(), QuotaStoreError>;

    /// Users with a non-zero admitted count, for fast-path reconciliation
    /// after a restart.
    async fn list_active(&self) -> Result<Vec<UserQuota>, QuotaStoreError>;
}

fn current_buckets() -> (u64, u64) {
    let now = unix_seconds();
    (day_bucket(now), month_bucket(now))
}

fn reserve_in_place(quota: &mut UserQuota, gpu_minutes: f64) -> ReserveOutcome {
    let (day, month) = current_buckets();
    quota.reset_if_epoch_elapsed(day, month);
    match quota.fits(gpu_minutes) {
        QuotaFit::DailyExceeded => ReserveOutcome::DailyExceeded(quota.clone()),
        QuotaFit::MonthlyExceeded => ReserveOutcome::MonthlyExceeded(quota.clone()),
        QuotaFit::Fits => {
            quota.reserve(gpu_minutes);
            ReserveOutcome::Reserved(quota.clone())
        }
    }
}

#[derive(Default)]
pub struct InMemoryQuotaStore {
    users: Mutex<HashMap<UserId, UserQuota>>,
}

impl InMemoryQuotaStore {
    fn with_user<T>(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
        f: impl FnOnce(&mut UserQuota) -> T,
    ) -> Result<T, QuotaStoreError> {
        let mut users = self
            .users
            .lock()
            .map_err(|_| QuotaStoreError("quota map poisoned".to_string()))?;
        let (day, month) = current_buckets();
        let quota = users
            .entry(user.clone())
            .or_insert_with(|| UserQuota::new(user.clone(), default_tier, day, month));
        Ok(f(quota))
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get_or_create(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
    ) -> Result<UserQuota, QuotaStoreError> {
        self.with_user(user, default_tier, |q| {
            let (day, month) = current_buckets();
            q.reset_if_epoch_elapsed(day, month);
            q.clone()
        })
    }

    async fn reserve(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
        gpu_minutes: f64,
    ) -> Result<ReserveOutcome, QuotaStoreError> {
        self.with_user(user, default_tier, |q| reserve_in_place(q, gpu_minutes))
    }

    async fn settle(
        &self,
        user: &UserId,
        reserved_gpu_minutes: f64,
        actual_gpu_minutes: Option<f64>,
    ) -> Result<(), QuotaStoreError> {
        self.with_user(user, QuotaTier::default(), |q| {
            q.release(reserved_gpu_minutes, actual_gpu_minutes);
        })
    }

    async fn set_tier(&self, user: &UserId, tier: QuotaTier) -> Result<(), QuotaStoreError> {
        self.with_user(user, tier, |q| {
            q.tier = tier;
        })
    }

    async fn list_active(&self) -> Result<Vec<UserQuota>, QuotaStoreError> {
        let users = self
            .users
            .lock()
            .map_err(|_| QuotaStoreError("quota map poisoned".to_string()))?;
        Ok(users
            .values()
            .filter(|q| q.active_jobs > 0)
            .cloned()
            .collect())
    }
}

/// rusqlite-backed quota store. Row operations run under `spawn_blocking`
/// with the connection behind a mutex; reserve executes inside one sqlite
/// transaction so check-then-increment stays atomic across instances sharing
/// the database file.
pub struct SqliteQuotaStore {
    conn: Arc<Mutex<Connection>>,
}

const QUOTA_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_quota (
    user_id TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    used_daily_gpu_minutes REAL NOT NULL DEFAULT 0,
    used_monthly_gpu_minutes REAL NOT NULL DEFAULT 0,
    active_jobs INTEGER NOT NULL DEFAULT 0,
    day_bucket INTEGER NOT NULL,
    month_bucket INTEGER NOT NULL
);
";

fn tier_from_str(raw: &str) -> QuotaTier {
    match raw {
        "standard" => QuotaTier::Standard,
        "priority" => QuotaTier::Priority,
        _ => QuotaTier::Free,
    }
}

fn row_to_quota(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserQuota> {
    let user_raw: String = row.get(0)?;
    let tier_raw: String = row.get(1)?;
    let user = UserId::parse(&user_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(UserQuota {
        user_id: user,
        tier: tier_from_str(&tier_raw),
        used_daily_gpu_minutes: row.get(2)?,
        used_monthly_gpu_minutes: row.get(3)?,
        active_jobs: row.get::<_, i64>(4)? as u32,
        day_bucket: row.get::<_, i64>(5)? as u64,
        month_bucket: row.get::<_, i64>(6)? as u64,
    })
}

impl SqliteQuotaStore {
    pub fn open(path: &Path) -> Result<Self, QuotaStoreError> {
        let conn = Connection::open(path).map_err(|e| QuotaStoreError(e.to_string()))?;
        conn.execute_batch(QUOTA_SCHEMA)
            .map_err(|e| QuotaStoreError(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, QuotaStoreError> {
        let conn = Connection::open_in_memory().map_err(|e| QuotaStoreError(e.to_string()))?;
        conn.execute_batch(QUOTA_SCHEMA)
            .map_err(|e| QuotaStoreError(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QuotaStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QuotaStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| QuotaStoreError("quota connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| QuotaStoreError(e.to_string()))?
    }
}

fn load_or_insert(
    tx: &rusqlite::Transaction<'_>,
    user: &UserId,
    default_tier: QuotaTier,
) -> Result<UserQuota, QuotaStoreError> {
    let existing = tx
        .query_row(
            "SELECT user_id, tier, used_daily_gpu_minutes, used_monthly_gpu_minutes,
                    active_jobs, day_bucket, month_bucket
             FROM user_quota WHERE user_id = ?1",
            params![user.as_str()],
            row_to_quota,
        )
        .optional()
        .map_err(|e| QuotaStoreError(e.to_string()))?;
    match existing {
        Some(mut quota) => {
            let (day, month) = current_buckets();
            quota.reset_if_epoch_elapsed(day, month);
            Ok(quota)
        }
        None => {
            let (day, month) = current_buckets();
            let quota = UserQuota::new(user.clone(), default_tier, day, month);
            tx.execute(
                "INSERT INTO user_quota (user_id, tier, day_bucket, month_bucket)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user.as_str(),
                    quota.tier.as_str(),
                    quota.day_bucket as i64,
                    quota.month_bucket as i64
                ],
            )
            .map_err(|e| QuotaStoreError(e.to_string()))?;
            Ok(quota)
        }
    }
}

fn persist(tx: &rusqlite::Transaction<'_>, quota: &UserQuota) -> Result<(), QuotaStoreError> {
    tx.execute(
        "UPDATE user_quota SET tier = ?2, used_daily_gpu_minutes = ?3,
                used_monthly_gpu_minutes = ?4, active_jobs = ?5,
                day_bucket = ?6, month_bucket = ?7
         WHERE user_id = ?1",
        params![
            quota.user_id.as_str(),
            quota.tier.as_str(),
            quota.used_daily_gpu_minutes,
            quota.used_monthly_gpu_minutes,
            i64::from(quota.active_jobs),
            quota.day_bucket as i64,
            quota.month_bucket as i64
        ],
    )
    .map_err(|e| QuotaStoreError(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn get_or_create(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
    ) -> Result<UserQuota, QuotaStoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| QuotaStoreError(e.to_string()))?;
            let quota = load_or_insert(&tx, &user, default_tier)?;
            persist(&tx, &quota)?;
            tx.commit().map_err(|e| QuotaStoreError(e.to_string()))?;
            Ok(quota)
        })
        .await
    }

    async fn reserve(
        &self,
        user: &UserId,
        default_tier: QuotaTier,
        gpu_minutes: f64,
    ) -> Result<ReserveOutcome, QuotaStoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| QuotaStoreError(e.to_string()))?;
            let mut quota = load_or_insert(&tx, &user, default_tier)?;
            let outcome = reserve_in_place(&mut quota, gpu_minutes);
            persist(&tx, &quota)?;
            tx.commit().map_err(|e| QuotaStoreError(e.to_string()))?;
            Ok(outcome)
        })
        .await
    }

    async fn settle(
        &self,
        user: &UserId,
        reserved_gpu_minutes: f64,
        actual_gpu_minutes: Option<f64>,
    ) -> Result<(), QuotaStoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| QuotaStoreError(e.to_string()))?;
            let mut quota = load_or_insert(&tx, &user, QuotaTier::default())?;
            quota.release(reserved_gpu_minutes, actual_gpu_minutes);
            persist(&tx, &quota)?;
            tx.commit().map_err(|e| QuotaStoreError(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn set_tier(&self, user: &UserId, tier: QuotaTier) -> Result<(), QuotaStoreError> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| QuotaStoreError(e.to_string()))?;
            let mut quota = load_or_insert(&tx, &user, tier)?;
            quota.tier = tier;
            persist(&tx, &quota)?;
            tx.commit().map_err(|e| QuotaStoreError(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<UserQuota>, QuotaStoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, tier, used_daily_gpu_minutes, used_monthly_gpu_minutes,
                            active_jobs, day_bucket, month_bucket
                     FROM user_quota WHERE active_jobs > 0",
                )
                .map_err(|e| QuotaStoreError(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_quota)
                .map_err(|e| QuotaStoreError(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| QuotaStoreError(e.to_string()))
        })
        .await
    }
}
