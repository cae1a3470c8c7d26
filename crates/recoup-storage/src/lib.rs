//! Relational store + evidence blob storage for the detection pipeline.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use recoup_core::{
    DamageRecord, DetectionJob, DetectionResult, FeeLineItem, InventoryRecord, JobStatus,
    NewDetectionResult, NewJob, RefundRecord, RuleType, SellerDataset, ShipmentRecord, Threshold,
    WhitelistItem,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recoup-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("column {column} holds an unreadable value: {message}")]
    Decode { column: &'static str, message: String },
    #[error("job {job_id} is no longer {expected}")]
    StaleJob { job_id: Uuid, expected: JobStatus },
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Database(err) => classify_sqlx_error(err),
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            StoreError::Migration(_) | StoreError::Decode { .. } | StoreError::StaleJob { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Only errors about the data or the SQL itself are final; connection loss,
/// pool pressure, shutdowns and lock conflicts are worth another attempt.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref()),
        sqlx::Error::Configuration(_)
        | sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_) => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

/// Classes 22 (data exception), 23 (integrity constraint) and 42 (syntax or
/// access rule) are final. Everything else, including unknown codes, is retried.
pub fn classify_sqlstate(code: Option<&str>) -> RetryDisposition {
    match code.map(|code| code.get(..2).unwrap_or(code)) {
        Some("22" | "23" | "42") => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

/// Delay schedule for repeated failures of the same operation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Always waits `interval`, regardless of how many failures preceded.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base_delay: interval,
            max_delay: interval,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue_job(&self, job: NewJob) -> Result<DetectionJob, StoreError>;

    /// Pollable jobs ordered by priority desc, then creation order asc. Read-only.
    async fn fetch_eligible_jobs(&self, limit: usize) -> Result<Vec<DetectionJob>, StoreError>;

    /// Atomically moves an eligible job to `processing` and bumps its attempt count.
    /// Returns `None` when the job was claimed elsewhere or is no longer eligible.
    async fn claim_job(&self, job_id: Uuid) -> Result<Option<DetectionJob>, StoreError>;

    async fn mark_job_retrying(&self, job_id: Uuid, reason: &str) -> Result<(), StoreError>;
    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Releases `processing` jobs whose `started_at` is older than `lease`: back to
    /// `retrying`, or `failed` once attempts are exhausted. Returns the released jobs.
    async fn reclaim_stale_jobs(&self, lease: Duration) -> Result<Vec<DetectionJob>, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<DetectionJob>, StoreError>;
    async fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError>;
}

#[async_trait]
pub trait RuleConfigStore: Send + Sync {
    /// Active thresholds that are either global or scoped to `seller_id`.
    async fn active_thresholds(&self, seller_id: &str) -> Result<Vec<Threshold>, StoreError>;
    async fn active_whitelist(&self, seller_id: &str) -> Result<Vec<WhitelistItem>, StoreError>;
}

#[async_trait]
pub trait SellerDataSource: Send + Sync {
    /// `None` when the seller is unknown.
    async fn load_dataset(
        &self,
        seller_id: &str,
        sync_id: &str,
    ) -> Result<Option<SellerDataset>, StoreError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn find_result(
        &self,
        seller_id: &str,
        rule_type: RuleType,
        dedup_hash: &str,
    ) -> Result<Option<DetectionResult>, StoreError>;

    /// Inserts `results` (skipping any `(seller, rule, hash)` already present) and
    /// marks the job `completed`, all in one transaction.
    async fn complete_job(
        &self,
        job_id: Uuid,
        results: &[NewDetectionResult],
    ) -> Result<PersistSummary, StoreError>;

    async fn results_for_seller(
        &self,
        seller_id: &str,
        limit: usize,
    ) -> Result<Vec<DetectionResult>, StoreError>;
    async fn results_for_job(&self, job_id: Uuid) -> Result<Vec<DetectionResult>, StoreError>;

    /// Sets the retroactive whitelisted flag. Returns false when no such result exists.
    async fn flag_result_whitelisted(&self, result_id: Uuid) -> Result<bool, StoreError>;
}

pub trait DetectionStore: JobStore + RuleConfigStore + SellerDataSource + ResultStore {}

impl<T> DetectionStore for T where T: JobStore + RuleConfigStore + SellerDataSource + ResultStore {}

const JOB_COLUMNS: &str = "id, seller_id, sync_id, status, priority, attempt_count, max_attempts, \
                           failure_reason, created_at, started_at, completed_at";

pub const LEASE_EXPIRED_REASON: &str = "processing lease expired before the job settled";

const RESULT_COLUMNS: &str = "id, seller_id, rule_type, severity, confidence, summary, \
                              evidence_ref, dedup_hash, job_id, whitelisted, created_at";

#[derive(Debug, Clone)]
pub struct PgDetectionStore {
    pool: PgPool,
}

impl PgDetectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode<T: std::str::FromStr>(column: &'static str, raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| StoreError::Decode {
        column,
        message: err.to_string(),
    })
}

fn job_from_row(row: &PgRow) -> Result<DetectionJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(DetectionJob {
        id: row.try_get("id")?,
        seller_id: row.try_get("seller_id")?,
        sync_id: row.try_get("sync_id")?,
        status: decode("status", &status)?,
        priority: row.try_get("priority")?,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<DetectionResult, StoreError> {
    let rule_type: String = row.try_get("rule_type")?;
    let severity: String = row.try_get("severity")?;
    Ok(DetectionResult {
        id: row.try_get("id")?,
        seller_id: row.try_get("seller_id")?,
        rule_type: decode("rule_type", &rule_type)?,
        severity: decode("severity", &severity)?,
        confidence: row.try_get("confidence")?,
        summary: row.try_get("summary")?,
        evidence_ref: row.try_get("evidence_ref")?,
        dedup_hash: row.try_get("dedup_hash")?,
        job_id: row.try_get("job_id")?,
        whitelisted: row.try_get("whitelisted")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobStore for PgDetectionStore {
    async fn enqueue_job(&self, job: NewJob) -> Result<DetectionJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO detection_jobs
                (id, seller_id, sync_id, status, priority, attempt_count, max_attempts)
            VALUES ($1, $2, $3, 'pending', $4, 0, $5)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&job.seller_id)
        .bind(&job.sync_id)
        .bind(job.priority)
        .bind(job.max_attempts.max(1))
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    async fn fetch_eligible_jobs(&self, limit: usize) -> Result<Vec<DetectionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM detection_jobs
             WHERE status IN ('pending', 'retrying')
               AND attempt_count < max_attempts
             ORDER BY priority DESC, created_at ASC, seq ASC
             LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_job(&self, job_id: Uuid) -> Result<Option<DetectionJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE detection_jobs
               SET status = 'processing',
                   attempt_count = attempt_count + 1,
                   started_at = NOW(),
                   completed_at = NULL
             WHERE id = $1
               AND status IN ('pending', 'retrying')
               AND attempt_count < max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_job_retrying(&self, job_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE detection_jobs
               SET status = 'retrying',
                   failure_reason = $2
             WHERE id = $1
               AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::StaleJob {
                job_id,
                expected: JobStatus::Processing,
            });
        }
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE detection_jobs
               SET status = 'failed',
                   failure_reason = $2,
                   completed_at = NOW()
             WHERE id = $1
               AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::StaleJob {
                job_id,
                expected: JobStatus::Processing,
            });
        }
        Ok(())
    }

    async fn reclaim_stale_jobs(&self, lease: Duration) -> Result<Vec<DetectionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE detection_jobs
               SET status = CASE WHEN attempt_count >= max_attempts
                                 THEN 'failed' ELSE 'retrying' END,
                   failure_reason = $2,
                   completed_at = CASE WHEN attempt_count >= max_attempts THEN NOW() END
             WHERE status = 'processing'
               AND started_at < NOW() - make_interval(secs => $1)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(lease.as_secs_f64())
        .bind(LEASE_EXPIRED_REASON)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<DetectionJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM detection_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
              FROM detection_jobs
             GROUP BY status
             ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push((decode("status", &status)?, row.try_get("total")?));
        }
        Ok(out)
    }
}

#[async_trait]
impl RuleConfigStore for PgDetectionStore {
    async fn active_thresholds(&self, seller_id: &str) -> Result<Vec<Threshold>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_type, operator, value, seller_id, active
              FROM detection_thresholds
             WHERE active
               AND (seller_id = $1 OR seller_id IS NULL)
             ORDER BY rule_type, value, id
            "#,
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let rule_type: String = row.try_get("rule_type")?;
            let operator: String = row.try_get("operator")?;
            let (Ok(rule_type), Ok(operator)) = (rule_type.parse(), operator.parse()) else {
                warn!(
                    threshold_id = %id,
                    rule_type,
                    operator,
                    "skipping threshold with unknown rule type or operator"
                );
                continue;
            };
            out.push(Threshold {
                id,
                rule_type,
                operator,
                value: row.try_get("value")?,
                seller_id: row.try_get("seller_id")?,
                active: row.try_get("active")?,
            });
        }
        Ok(out)
    }

    async fn active_whitelist(&self, seller_id: &str) -> Result<Vec<WhitelistItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, scope, value, reason, active, seller_id
              FROM whitelist_items
             WHERE active
               AND (seller_id = $1 OR seller_id IS NULL)
             ORDER BY scope, value, id
            "#,
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let scope: String = row.try_get("scope")?;
            out.push(WhitelistItem {
                id: row.try_get("id")?,
                scope: decode("scope", &scope)?,
                value: row.try_get("value")?,
                reason: row.try_get("reason")?,
                active: row.try_get("active")?,
                seller_id: row.try_get("seller_id")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SellerDataSource for PgDetectionStore {
    async fn load_dataset(
        &self,
        seller_id: &str,
        sync_id: &str,
    ) -> Result<Option<SellerDataset>, StoreError> {
        let Some(seller) = sqlx::query("SELECT account_id FROM sellers WHERE id = $1")
            .bind(seller_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let inventory = sqlx::query(
            r#"
            SELECT sku, asin, vendor, expected_quantity, counted_quantity, unit_cost
              FROM inventory_records
             WHERE seller_id = $1 AND sync_id = $2
             ORDER BY sku
            "#,
        )
        .bind(seller_id)
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(InventoryRecord {
                sku: row.try_get("sku")?,
                asin: row.try_get("asin")?,
                vendor: row.try_get("vendor")?,
                expected_quantity: row.try_get("expected_quantity")?,
                counted_quantity: row.try_get("counted_quantity")?,
                unit_cost: row.try_get("unit_cost")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let fees = sqlx::query(
            r#"
            SELECT line_id, sku, asin, fee_type, amount, expected_fee
              FROM fee_line_items
             WHERE seller_id = $1 AND sync_id = $2
             ORDER BY line_id
            "#,
        )
        .bind(seller_id)
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(FeeLineItem {
                line_id: row.try_get("line_id")?,
                sku: row.try_get("sku")?,
                asin: row.try_get("asin")?,
                fee_type: row.try_get("fee_type")?,
                amount: row.try_get("amount")?,
                expected_fee: row.try_get("expected_fee")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let damages = sqlx::query(
            r#"
            SELECT damage_id, sku, asin, quantity, unit_value, reimbursed_amount, reason_code
              FROM damage_records
             WHERE seller_id = $1 AND sync_id = $2
             ORDER BY damage_id
            "#,
        )
        .bind(seller_id)
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(DamageRecord {
                damage_id: row.try_get("damage_id")?,
                sku: row.try_get("sku")?,
                asin: row.try_get("asin")?,
                quantity: row.try_get("quantity")?,
                unit_value: row.try_get("unit_value")?,
                reimbursed_amount: row.try_get("reimbursed_amount")?,
                reason_code: row.try_get("reason_code")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let shipments = sqlx::query(
            r#"
            SELECT shipment_id, sku, asin, vendor, units_shipped, units_received, unit_cost
              FROM shipment_records
             WHERE seller_id = $1 AND sync_id = $2
             ORDER BY shipment_id, sku
            "#,
        )
        .bind(seller_id)
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(ShipmentRecord {
                shipment_id: row.try_get("shipment_id")?,
                sku: row.try_get("sku")?,
                asin: row.try_get("asin")?,
                vendor: row.try_get("vendor")?,
                units_shipped: row.try_get("units_shipped")?,
                units_received: row.try_get("units_received")?,
                unit_cost: row.try_get("unit_cost")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let refunds = sqlx::query(
            r#"
            SELECT order_id, sku, asin, refund_amount, returned, refunded_at
              FROM refund_records
             WHERE seller_id = $1 AND sync_id = $2
             ORDER BY order_id
            "#,
        )
        .bind(seller_id)
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(RefundRecord {
                order_id: row.try_get("order_id")?,
                sku: row.try_get("sku")?,
                asin: row.try_get("asin")?,
                refund_amount: row.try_get("refund_amount")?,
                returned: row.try_get("returned")?,
                refunded_at: row.try_get("refunded_at")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Some(SellerDataset {
            seller_id: seller_id.to_string(),
            sync_id: sync_id.to_string(),
            account_id: seller.try_get("account_id")?,
            inventory,
            fees,
            damages,
            shipments,
            refunds,
        }))
    }
}

#[async_trait]
impl ResultStore for PgDetectionStore {
    async fn find_result(
        &self,
        seller_id: &str,
        rule_type: RuleType,
        dedup_hash: &str,
    ) -> Result<Option<DetectionResult>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
              FROM detection_results
             WHERE seller_id = $1 AND rule_type = $2 AND dedup_hash = $3
            "#
        ))
        .bind(seller_id)
        .bind(rule_type.as_str())
        .bind(dedup_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        results: &[NewDetectionResult],
    ) -> Result<PersistSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = PersistSummary::default();

        for result in results {
            // The unique constraint is authoritative; a concurrent insert of the
            // same finding lands here as a no-op rather than an error.
            let inserted = sqlx::query(
                r#"
                INSERT INTO detection_results
                    (id, seller_id, rule_type, severity, confidence, summary,
                     evidence_ref, dedup_hash, job_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (seller_id, rule_type, dedup_hash) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&result.seller_id)
            .bind(result.rule_type.as_str())
            .bind(result.severity.as_str())
            .bind(result.confidence)
            .bind(&result.summary)
            .bind(&result.evidence_ref)
            .bind(&result.dedup_hash)
            .bind(result.job_id)
            .fetch_optional(&mut *tx)
            .await?;
            if inserted.is_some() {
                summary.inserted += 1;
            } else {
                summary.duplicates += 1;
            }
        }

        let done = sqlx::query(
            r#"
            UPDATE detection_jobs
               SET status = 'completed',
                   failure_reason = NULL,
                   completed_at = NOW()
             WHERE id = $1
               AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::StaleJob {
                job_id,
                expected: JobStatus::Processing,
            });
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn results_for_seller(
        &self,
        seller_id: &str,
        limit: usize,
    ) -> Result<Vec<DetectionResult>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
              FROM detection_results
             WHERE seller_id = $1
             ORDER BY created_at DESC
             LIMIT $2
            "#
        ))
        .bind(seller_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn results_for_job(&self, job_id: Uuid) -> Result<Vec<DetectionResult>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
              FROM detection_results
             WHERE job_id = $1
             ORDER BY created_at ASC
            "#
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn flag_result_whitelisted(&self, result_id: Uuid) -> Result<bool, StoreError> {
        let done = sqlx::query("UPDATE detection_results SET whitelisted = TRUE WHERE id = $1")
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    // insertion order doubles as creation order
    jobs: Vec<DetectionJob>,
    thresholds: Vec<Threshold>,
    whitelist: Vec<WhitelistItem>,
    sellers: HashMap<String, Option<String>>,
    datasets: HashMap<(String, String), SellerDataset>,
    results: Vec<DetectionResult>,
}

impl MemoryState {
    fn job_mut(&mut self, job_id: Uuid) -> Option<&mut DetectionJob> {
        self.jobs.iter_mut().find(|job| job.id == job_id)
    }

    fn processing_job_mut(&mut self, job_id: Uuid) -> Result<&mut DetectionJob, StoreError> {
        match self.job_mut(job_id) {
            Some(job) if job.status == JobStatus::Processing => Ok(job),
            _ => Err(StoreError::StaleJob {
                job_id,
                expected: JobStatus::Processing,
            }),
        }
    }
}

/// Process-local store with the same semantics as [`PgDetectionStore`].
/// Used by tests and offline dry runs.
#[derive(Debug, Default)]
pub struct MemoryDetectionStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }

    pub async fn insert_seller(&self, seller_id: impl Into<String>, account_id: Option<String>) {
        self.state.lock().await.sellers.insert(seller_id.into(), account_id);
    }

    pub async fn insert_dataset(&self, dataset: SellerDataset) {
        let mut state = self.state.lock().await;
        state
            .sellers
            .insert(dataset.seller_id.clone(), dataset.account_id.clone());
        state
            .datasets
            .insert((dataset.seller_id.clone(), dataset.sync_id.clone()), dataset);
    }

    pub async fn insert_threshold(&self, threshold: Threshold) {
        self.state.lock().await.thresholds.push(threshold);
    }

    pub async fn insert_whitelist_item(&self, item: WhitelistItem) {
        self.state.lock().await.whitelist.push(item);
    }

    pub async fn all_jobs(&self) -> Vec<DetectionJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn all_results(&self) -> Vec<DetectionResult> {
        self.state.lock().await.results.clone()
    }

    pub async fn count_in_status(&self, status: JobStatus) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .filter(|job| job.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryDetectionStore {
    async fn enqueue_job(&self, job: NewJob) -> Result<DetectionJob, StoreError> {
        self.check_available()?;
        let job = DetectionJob {
            id: Uuid::new_v4(),
            seller_id: job.seller_id,
            sync_id: job.sync_id,
            status: JobStatus::Pending,
            priority: job.priority,
            attempt_count: 0,
            max_attempts: job.max_attempts.max(1),
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.state.lock().await.jobs.push(job.clone());
        Ok(job)
    }

    async fn fetch_eligible_jobs(&self, limit: usize) -> Result<Vec<DetectionJob>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut eligible = state
            .jobs
            .iter()
            .filter(|job| job.is_eligible())
            .cloned()
            .collect::<Vec<_>>();
        // stable sort: equal (priority, created_at) keeps insertion order
        eligible.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn claim_job(&self, job_id: Uuid) -> Result<Option<DetectionJob>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(job) = state.job_mut(job_id) else {
            return Ok(None);
        };
        if !job.is_eligible() {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.attempt_count += 1;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        Ok(Some(job.clone()))
    }

    async fn mark_job_retrying(&self, job_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let job = state.processing_job_mut(job_id)?;
        job.status = JobStatus::Retrying;
        job.failure_reason = Some(reason.to_string());
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let job = state.processing_job_mut(job_id)?;
        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.to_string());
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn reclaim_stale_jobs(&self, lease: Duration) -> Result<Vec<DetectionJob>, StoreError> {
        self.check_available()?;
        let Some(cutoff) = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
        else {
            return Ok(Vec::new());
        };
        let mut state = self.state.lock().await;
        let mut released = Vec::new();
        for job in state.jobs.iter_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|at| at <= cutoff);
            if !stale {
                continue;
            }
            job.failure_reason = Some(LEASE_EXPIRED_REASON.to_string());
            if job.attempts_exhausted() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
            } else {
                job.status = JobStatus::Retrying;
            }
            released.push(job.clone());
        }
        Ok(released)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<DetectionJob>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .iter()
            .find(|job| job.id == job_id)
            .cloned())
    }

    async fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(JobStatus::ALL
            .into_iter()
            .map(|status| {
                let total = state.jobs.iter().filter(|job| job.status == status).count() as i64;
                (status, total)
            })
            .filter(|(_, total)| *total > 0)
            .collect())
    }
}

#[async_trait]
impl RuleConfigStore for MemoryDetectionStore {
    async fn active_thresholds(&self, seller_id: &str) -> Result<Vec<Threshold>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .thresholds
            .iter()
            .filter(|t| t.active && t.seller_id.as_deref().map_or(true, |s| s == seller_id))
            .cloned()
            .collect())
    }

    async fn active_whitelist(&self, seller_id: &str) -> Result<Vec<WhitelistItem>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .whitelist
            .iter()
            .filter(|w| w.active && w.seller_id.as_deref().map_or(true, |s| s == seller_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SellerDataSource for MemoryDetectionStore {
    async fn load_dataset(
        &self,
        seller_id: &str,
        sync_id: &str,
    ) -> Result<Option<SellerDataset>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let Some(account_id) = state.sellers.get(seller_id) else {
            return Ok(None);
        };
        let dataset = state
            .datasets
            .get(&(seller_id.to_string(), sync_id.to_string()))
            .cloned()
            .unwrap_or_else(|| SellerDataset {
                seller_id: seller_id.to_string(),
                sync_id: sync_id.to_string(),
                account_id: account_id.clone(),
                ..Default::default()
            });
        Ok(Some(dataset))
    }
}

#[async_trait]
impl ResultStore for MemoryDetectionStore {
    async fn find_result(
        &self,
        seller_id: &str,
        rule_type: RuleType,
        dedup_hash: &str,
    ) -> Result<Option<DetectionResult>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .results
            .iter()
            .find(|r| {
                r.seller_id == seller_id && r.rule_type == rule_type && r.dedup_hash == dedup_hash
            })
            .cloned())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        results: &[NewDetectionResult],
    ) -> Result<PersistSummary, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.processing_job_mut(job_id)?;

        let mut summary = PersistSummary::default();
        let now = Utc::now();
        for result in results {
            let exists = state.results.iter().any(|r| {
                r.seller_id == result.seller_id
                    && r.rule_type == result.rule_type
                    && r.dedup_hash == result.dedup_hash
            });
            if exists {
                summary.duplicates += 1;
                continue;
            }
            state.results.push(DetectionResult {
                id: Uuid::new_v4(),
                seller_id: result.seller_id.clone(),
                rule_type: result.rule_type,
                severity: result.severity,
                confidence: result.confidence,
                summary: result.summary.clone(),
                evidence_ref: result.evidence_ref.clone(),
                dedup_hash: result.dedup_hash.clone(),
                job_id: result.job_id,
                whitelisted: false,
                created_at: now,
            });
            summary.inserted += 1;
        }

        let job = state.processing_job_mut(job_id)?;
        job.status = JobStatus::Completed;
        job.failure_reason = None;
        job.completed_at = Some(now);
        Ok(summary)
    }

    async fn results_for_seller(
        &self,
        seller_id: &str,
        limit: usize,
    ) -> Result<Vec<DetectionResult>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .results
            .iter()
            .rev()
            .filter(|r| r.seller_id == seller_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn results_for_job(&self, job_id: Uuid) -> Result<Vec<DetectionResult>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn flag_result_whitelisted(&self, result_id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.results.iter_mut().find(|r| r.id == result_id) {
            Some(result) => {
                result.whitelisted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// The key already held byte-identical content.
    pub deduplicated: bool,
}

/// Write-once JSON document storage keyed by relative path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_json(&self, key: &str, document: &JsonValue) -> anyhow::Result<StoredBlob>;
    async fn get_json(&self, key: &str) -> anyhow::Result<Option<JsonValue>>;
}

#[derive(Debug, Error)]
#[error("blob key `{key}` {problem}")]
pub struct InvalidBlobKey {
    pub key: String,
    pub problem: &'static str,
}

pub fn validate_blob_key(key: &str) -> Result<(), InvalidBlobKey> {
    let invalid = |problem| InvalidBlobKey {
        key: key.to_string(),
        problem,
    };
    let path = Path::new(key);
    if key.is_empty() || path.is_absolute() {
        return Err(invalid("must be a non-empty relative path"));
    }
    if path.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(invalid("must not contain `.`, `..` or root components"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes immutably at `key` using an atomic temp-file rename.
    pub async fn store_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        validate_blob_key(key)?;
        let content_hash = sha256_hex(bytes);
        let absolute_path = self.root.join(key);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating blob directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking blob path {}", absolute_path.display()))?
        {
            return self.existing(key, &absolute_path, content_hash, bytes.len()).await;
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob file {}", temp_path.display()))?;
        drop(file);

        // rename(2) silently replaces on unix, so re-check right before it
        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            let _ = fs::remove_file(&temp_path).await;
            return self.existing(key, &absolute_path, content_hash, bytes.len()).await;
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredBlob {
                key: key.to_string(),
                content_hash,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp blob {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    async fn existing(
        &self,
        key: &str,
        absolute_path: &Path,
        content_hash: String,
        byte_size: usize,
    ) -> anyhow::Result<StoredBlob> {
        let current = fs::read(absolute_path)
            .await
            .with_context(|| format!("reading existing blob {}", absolute_path.display()))?;
        if sha256_hex(&current) != content_hash {
            bail!("blob key `{key}` already holds different content");
        }
        Ok(StoredBlob {
            key: key.to_string(),
            content_hash,
            byte_size,
            deduplicated: true,
        })
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_json(&self, key: &str, document: &JsonValue) -> anyhow::Result<StoredBlob> {
        let bytes = serde_json::to_vec_pretty(document).context("serializing blob document")?;
        self.store_bytes(key, &bytes).await
    }

    async fn get_json(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        validate_blob_key(key)?;
        let path = self.root.join(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing blob {}", path.display()))?,
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading blob {}", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys = self.blobs.lock().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_json(&self, key: &str, document: &JsonValue) -> anyhow::Result<StoredBlob> {
        validate_blob_key(key)?;
        let bytes = serde_json::to_vec_pretty(document).context("serializing blob document")?;
        let content_hash = sha256_hex(&bytes);
        let mut blobs = self.blobs.lock().await;
        if let Some(existing) = blobs.get(key) {
            if sha256_hex(existing) != content_hash {
                bail!("blob key `{key}` already holds different content");
            }
            return Ok(StoredBlob {
                key: key.to_string(),
                content_hash,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }
        let byte_size = bytes.len();
        blobs.insert(key.to_string(), bytes);
        Ok(StoredBlob {
            key: key.to_string(),
            content_hash,
            byte_size,
            deduplicated: false,
        })
    }

    async fn get_json(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        validate_blob_key(key)?;
        let blobs = self.blobs.lock().await;
        blobs
            .get(key)
            .map(|bytes| {
                serde_json::from_slice(bytes).with_context(|| format!("parsing blob {key}"))
            })
            .transpose()
    }
}
