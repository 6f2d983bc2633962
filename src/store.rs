//! Persistence for transfer jobs and deposit records.
//!
//! Both are stored as JSON payloads keyed the way they are looked up:
//! transfers by job id, deposits by (chain, depositor, tx hash). The
//! status column is duplicated out of the payload for operator queries.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::configure_sqlite_pool;
use crate::deposit::DepositRecord;
use crate::job::{TransferJob, TransferJobId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or replaces the job.
    async fn save_job(&self, job: &TransferJob) -> Result<(), StoreError>;

    async fn load_job(&self, id: TransferJobId) -> Result<Option<TransferJob>, StoreError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<TransferJob>, StoreError>;

    /// Claims job `id` for `holder`. Returns false while another holder's
    /// lease is live. Leases older than [`LEASE_TIMEOUT_MINUTES`] are
    /// considered abandoned and are cleared first.
    async fn try_acquire_lease(&self, id: TransferJobId, holder: &str)
    -> Result<bool, StoreError>;

    /// Drops the lease on job `id` if `holder` still owns it.
    async fn release_lease(&self, id: TransferJobId, holder: &str) -> Result<(), StoreError>;
}

pub const LEASE_TIMEOUT_MINUTES: i64 = 15;

#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Inserts or replaces the record for its (chain, depositor, tx hash).
    async fn save_deposit(&self, record: &DepositRecord) -> Result<(), StoreError>;

    /// Most recently submitted deposit for `depositor` on `chain`.
    async fn latest_deposit(
        &self,
        chain: &str,
        depositor: Address,
    ) -> Result<Option<DepositRecord>, StoreError>;

    /// Every deposit for `depositor` across chains, oldest first.
    async fn deposits(&self, depositor: Address) -> Result<Vec<DepositRecord>, StoreError>;
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = configure_sqlite_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Applies pending migrations to `pool`.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!().run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn save_job(&self, job: &TransferJob) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)?;

        sqlx::query(
            r#"
            INSERT INTO transfer_jobs (id, status, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(payload)
        .bind(timestamp(job.created_at))
        .bind(timestamp(job.updated_at))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, status = %job.status, "Saved transfer job");
        Ok(())
    }

    async fn load_job(&self, id: TransferJobId) -> Result<Option<TransferJob>, StoreError> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM transfer_jobs WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(payload
            .map(|payload| serde_json::from_str(&payload))
            .transpose()?)
    }

    async fn list_jobs(&self) -> Result<Vec<TransferJob>, StoreError> {
        let payloads: Vec<String> =
            sqlx::query_scalar("SELECT payload FROM transfer_jobs ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;

        Ok(payloads
            .iter()
            .map(|payload| serde_json::from_str(payload))
            .collect::<Result<_, _>>()?)
    }

    async fn try_acquire_lease(
        &self,
        id: TransferJobId,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let mut sql_tx = self.pool.begin().await?;
        let job_id = id.to_string();

        let cleanup = sqlx::query(
            "DELETE FROM job_leases WHERE job_id = ?1 AND acquired_at < datetime('now', ?2)",
        )
        .bind(&job_id)
        .bind(format!("-{LEASE_TIMEOUT_MINUTES} minutes"))
        .execute(sql_tx.as_mut())
        .await?;

        if cleanup.rows_affected() > 0 {
            info!(%job_id, "Cleared stale lease older than {LEASE_TIMEOUT_MINUTES} minutes");
        }

        let inserted =
            sqlx::query("INSERT OR IGNORE INTO job_leases (job_id, holder) VALUES (?1, ?2)")
                .bind(&job_id)
                .bind(holder)
                .execute(sql_tx.as_mut())
                .await?;

        sql_tx.commit().await?;

        let acquired = inserted.rows_affected() > 0;
        if !acquired {
            warn!(%job_id, "Transfer job lease is held by another worker");
        }

        Ok(acquired)
    }

    async fn release_lease(&self, id: TransferJobId, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_leases WHERE job_id = ?1 AND holder = ?2")
            .bind(id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl DepositStore for SqliteStore {
    async fn save_deposit(&self, record: &DepositRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO deposit_records
                (chain, depositor, tx_hash, status, payload, submitted_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (chain, depositor, tx_hash) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.chain)
        .bind(record.depositor.to_string())
        .bind(record.tx_hash.to_string())
        .bind(record.status.as_str())
        .bind(payload)
        .bind(timestamp(record.submitted_at))
        .bind(timestamp(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_deposit(
        &self,
        chain: &str,
        depositor: Address,
    ) -> Result<Option<DepositRecord>, StoreError> {
        let payload: Option<String> = sqlx::query_scalar(
            r#"
            SELECT payload FROM deposit_records
            WHERE chain = ?1 AND depositor = ?2
            ORDER BY submitted_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(chain)
        .bind(depositor.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(payload
            .map(|payload| serde_json::from_str(&payload))
            .transpose()?)
    }

    async fn deposits(&self, depositor: Address) -> Result<Vec<DepositRecord>, StoreError> {
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM deposit_records WHERE depositor = ?1 ORDER BY submitted_at, rowid",
        )
        .bind(depositor.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(payloads
            .iter()
            .map(|payload| serde_json::from_str(payload))
            .collect::<Result<_, _>>()?)
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: Mutex<HashMap<TransferJobId, TransferJob>>,
    leases: Mutex<HashMap<TransferJobId, (String, DateTime<Utc>)>>,
    deposits: Mutex<Vec<DepositRecord>>,
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn save_job(&self, job: &TransferJob) -> Result<(), StoreError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: TransferJobId) -> Result<Option<TransferJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<TransferJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn try_acquire_lease(
        &self,
        id: TransferJobId,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let stale_before = Utc::now() - Duration::minutes(LEASE_TIMEOUT_MINUTES);

        if let Some((_, acquired_at)) = leases.get(&id) {
            if *acquired_at >= stale_before {
                return Ok(false);
            }
        }

        leases.insert(id, (holder.to_string(), Utc::now()));
        Ok(true)
    }

    async fn release_lease(&self, id: TransferJobId, holder: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.get(&id).is_some_and(|(owner, _)| owner == holder) {
            leases.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl DepositStore for InMemoryStore {
    async fn save_deposit(&self, record: &DepositRecord) -> Result<(), StoreError> {
        let mut deposits = self
            .deposits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match deposits.iter_mut().find(|existing| {
            existing.chain == record.chain
                && existing.depositor == record.depositor
                && existing.tx_hash == record.tx_hash
        }) {
            Some(existing) => *existing = record.clone(),
            None => deposits.push(record.clone()),
        }

        Ok(())
    }

    async fn latest_deposit(
        &self,
        chain: &str,
        depositor: Address,
    ) -> Result<Option<DepositRecord>, StoreError> {
        Ok(self
            .deposits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.chain == chain && record.depositor == depositor)
            .max_by_key(|record| record.submitted_at)
            .cloned())
    }

    async fn deposits(&self, depositor: Address) -> Result<Vec<DepositRecord>, StoreError> {
        Ok(self
            .deposits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.depositor == depositor)
            .cloned()
            .collect())
    }
}
