//! Corrective billing operations. Each one is keyed by a reference derived
//! from the original request, so invoking it again never writes a second
//! billing record.

use super::audit::AuditLogger;
use super::context::BillingStage;
use super::ledger::{
    LedgerEntry, LedgerStore, RecordType, adjustment_reference, refund_reference,
    usage_reference,
};
use super::manager::{BillingManager, BillingResult};
use super::{BillingError, BillingErrorKind};
use crate::users::parse_rfc3339;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RetryBilling,
    Refund,
    Adjustment,
}

impl TaskType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "retry_billing" => Some(Self::RetryBilling),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryBilling => "retry_billing",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompensationTask {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub user_id: String,
    pub usage_log_id: Option<String>,
    pub request_id: Option<String>,
    pub amount_nano_usd: i128,
    pub reason: String,
    pub reference: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct NewTask<'a> {
    task_type: TaskType,
    user_id: &'a str,
    usage_log_id: Option<&'a str>,
    request_id: Option<&'a str>,
    amount_nano_usd: i128,
    reason: &'a str,
    reference: String,
}

const TASK_COLUMNS: &str = "id, task_type, status, user_id, usage_log_id, request_id, \
    amount_nano_usd, reason, reference, attempts, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct CompensationStore {
    pool: Pool<Sqlite>,
}

impl CompensationStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS compensation_tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL CHECK (task_type IN ('retry_billing', 'refund', 'adjustment')),
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'processed', 'failed', 'expired')),
                user_id TEXT NOT NULL,
                usage_log_id TEXT,
                request_id TEXT,
                amount_nano_usd TEXT NOT NULL DEFAULT '0',
                reason TEXT NOT NULL DEFAULT '',
                reference TEXT NOT NULL UNIQUE,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_compensation_tasks_user ON compensation_tasks(user_id, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    async fn get_or_create(&self, task: NewTask<'_>) -> Result<CompensationTask, String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT OR IGNORE INTO compensation_tasks (id, task_type, user_id, usage_log_id,
                    request_id, amount_nano_usd, reason, reference, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(task.task_type.as_str())
        .bind(task.user_id)
        .bind(task.usage_log_id)
        .bind(task.request_id)
        .bind(task.amount_nano_usd.to_string())
        .bind(task.reason)
        .bind(&task.reference)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        self.get_by_reference(&task.reference)
            .await?
            .ok_or_else(|| "compensation task not found after insert".to_string())
    }

    pub async fn get_by_reference(&self, reference: &str) -> Result<Option<CompensationTask>, String> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM compensation_tasks WHERE reference = ?");
        let row = sqlx::query(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_task(&row)).transpose()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<CompensationTask>, String> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM compensation_tasks WHERE user_id = ? ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_task).collect()
    }

    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempts: i64,
        last_error: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE compensation_tasks
               SET status = ?, attempts = ?, last_error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(attempts)
        .bind(last_error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<CompensationTask, String> {
    let type_raw: String = row.try_get("task_type").map_err(|e| e.to_string())?;
    let status_raw: String = row.try_get("status").map_err(|e| e.to_string())?;
    let amount_raw: String = row.try_get("amount_nano_usd").map_err(|e| e.to_string())?;
    Ok(CompensationTask {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        task_type: TaskType::from_str(&type_raw)
            .ok_or_else(|| format!("invalid task type: {type_raw}"))?,
        status: TaskStatus::from_str(&status_raw)
            .ok_or_else(|| format!("invalid task status: {status_raw}"))?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        usage_log_id: row.try_get("usage_log_id").map_err(|e| e.to_string())?,
        request_id: row.try_get("request_id").map_err(|e| e.to_string())?,
        amount_nano_usd: crate::users::parse_nano_usd(&amount_raw)?,
        reason: row.try_get("reason").map_err(|e| e.to_string())?,
        reference: row.try_get("reference").map_err(|e| e.to_string())?,
        attempts: row.try_get("attempts").map_err(|e| e.to_string())?,
        last_error: row.try_get("last_error").map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        updated_at: parse_rfc3339(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
    })
}

/// A reference names one operation; reusing it for another amount is a
/// caller error, not a replay.
fn ensure_same_amount(task: &CompensationTask, amount_nano_usd: i128) -> Result<(), BillingError> {
    if task.amount_nano_usd != amount_nano_usd {
        return Err(BillingError::new(
            BillingErrorKind::Conflict,
            format!(
                "{} {} already exists for {} nano-USD",
                task.task_type.as_str(),
                task.reference,
                task.amount_nano_usd
            ),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct CompensationService {
    store: CompensationStore,
    ledger: LedgerStore,
    manager: BillingManager,
    audit: AuditLogger,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl CompensationService {
    pub fn new(
        store: CompensationStore,
        manager: BillingManager,
        retry_attempts: u32,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            ledger: manager.ledger().clone(),
            audit: manager.audit().clone(),
            manager,
            retry_attempts: retry_attempts.max(1),
            retry_interval,
        }
    }

    /// Re-runs the charge for a successful usage log that has no billing record.
    pub async fn retry_missed_charge(
        &self,
        usage_log_id: &str,
    ) -> Result<CompensationTask, BillingError> {
        let log = self
            .ledger
            .get_usage_log(usage_log_id)
            .await
            .map_err(BillingError::internal)?
            .ok_or_else(|| BillingError::new(BillingErrorKind::NotFound, "usage log not found"))?;
        if !log.success || !(200..300).contains(&log.status_code) {
            return Err(BillingError::new(
                BillingErrorKind::InvalidRequest,
                "usage log is not billable",
            ));
        }

        let task = self
            .store
            .get_or_create(NewTask {
                task_type: TaskType::RetryBilling,
                user_id: &log.user_id,
                usage_log_id: Some(&log.id),
                request_id: Some(&log.request_id),
                amount_nano_usd: 0,
                reason: "missed charge",
                reference: usage_reference(&log.request_id),
            })
            .await
            .map_err(BillingError::internal)?;
        if task.status == TaskStatus::Processed && log.is_billed {
            return Ok(task);
        }
        let manager = &self.manager;
        let log = &log;
        self.execute(task, move || manager.charge_usage_log(log))
            .await
    }

    /// Settles an async job whose completion never reached billing. The
    /// charge reuses the job's `usage:` reference, so it lands at most once.
    pub async fn settle_async_job(
        &self,
        request_id: &str,
        success: bool,
        reason: Option<&str>,
    ) -> Result<BillingResult, BillingError> {
        tracing::info!(request_id = %request_id, success, "settling stranded async job");
        self.manager
            .process_async_completion(request_id, success, reason)
            .await
    }

    /// Credits back part or all of a billed request.
    pub async fn refund(
        &self,
        request_id: &str,
        amount_nano_usd: i128,
        reason: &str,
    ) -> Result<CompensationTask, BillingError> {
        let log = self
            .ledger
            .get_usage_log_by_request_id(request_id)
            .await
            .map_err(BillingError::internal)?
            .ok_or_else(|| BillingError::new(BillingErrorKind::NotFound, "usage log not found"))?;
        if !log.is_billed {
            return Err(BillingError::new(
                BillingErrorKind::InvalidRequest,
                "request has not been billed",
            ));
        }
        let charged = self
            .ledger
            .find_record_by_reference(&usage_reference(request_id))
            .await
            .map_err(BillingError::internal)?
            .map(|record| -record.amount_nano_usd)
            .or(log.actual_cost_nano)
            .unwrap_or(0);
        if amount_nano_usd <= 0 || amount_nano_usd > charged {
            return Err(BillingError::new(
                BillingErrorKind::InvalidRequest,
                "refund amount must be positive and at most the charged amount",
            ));
        }

        let task = self
            .store
            .get_or_create(NewTask {
                task_type: TaskType::Refund,
                user_id: &log.user_id,
                usage_log_id: Some(&log.id),
                request_id: Some(request_id),
                amount_nano_usd,
                reason,
                reference: refund_reference(request_id),
            })
            .await
            .map_err(BillingError::internal)?;
        ensure_same_amount(&task, amount_nano_usd)?;
        if task.status == TaskStatus::Processed {
            return Ok(task);
        }

        let entry = LedgerEntry {
            user_id: log.user_id.clone(),
            record_type: RecordType::Refund,
            amount_nano_usd,
            reference: refund_reference(request_id),
            description: reason.to_string(),
            usage_log_id: Some(log.id.clone()),
            request_id: Some(request_id.to_string()),
        };
        let ledger = &self.ledger;
        let entry = &entry;
        let log_id = log.id.as_str();
        let task = self
            .execute(task, move || async move {
                let outcome = ledger.apply_entry(entry).await?;
                ledger
                    .set_stage(log_id, BillingStage::Refunded, None)
                    .await
                    .map_err(BillingError::internal)?;
                Ok(outcome)
            })
            .await?;
        self.audit
            .refund(request_id, &log.user_id, amount_nano_usd, reason);
        Ok(task)
    }

    /// Applies a signed correction to a user's balance.
    pub async fn adjust_balance(
        &self,
        user_id: &str,
        amount_nano_usd: i128,
        reason: &str,
        reference: &str,
    ) -> Result<CompensationTask, BillingError> {
        if amount_nano_usd == 0 {
            return Err(BillingError::new(
                BillingErrorKind::InvalidRequest,
                "adjustment amount must be non-zero",
            ));
        }
        if reference.trim().is_empty() {
            return Err(BillingError::new(
                BillingErrorKind::InvalidRequest,
                "adjustment reference is required",
            ));
        }
        let reference = adjustment_reference(user_id, reference.trim());
        let task = self
            .store
            .get_or_create(NewTask {
                task_type: TaskType::Adjustment,
                user_id,
                usage_log_id: None,
                request_id: None,
                amount_nano_usd,
                reason,
                reference: reference.clone(),
            })
            .await
            .map_err(BillingError::internal)?;
        ensure_same_amount(&task, amount_nano_usd)?;
        if task.status == TaskStatus::Processed {
            return Ok(task);
        }

        let entry = LedgerEntry {
            user_id: user_id.to_string(),
            record_type: RecordType::Correction,
            amount_nano_usd,
            reference: reference.clone(),
            description: reason.to_string(),
            usage_log_id: None,
            request_id: None,
        };
        let ledger = &self.ledger;
        let entry = &entry;
        let task = self
            .execute(task, move || ledger.apply_entry(entry))
            .await?;
        self.audit
            .adjustment(user_id, amount_nano_usd, reason, &reference);
        Ok(task)
    }

    pub async fn tasks_for_user(&self, user_id: &str) -> Result<Vec<CompensationTask>, BillingError> {
        self.store
            .list_for_user(user_id)
            .await
            .map_err(BillingError::internal)
    }

    /// Runs `op` with bounded retries. Only internal failures are retried.
    async fn execute<F, Fut, T>(
        &self,
        task: CompensationTask,
        op: F,
    ) -> Result<CompensationTask, BillingError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BillingError>>,
    {
        let mut attempts = task.attempts;
        let mut last_error = None;
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }
            attempts += 1;
            match op().await {
                Ok(_) => {
                    self.store
                        .finish(&task.id, TaskStatus::Processed, attempts, None)
                        .await
                        .map_err(BillingError::internal)?;
                    return self.reload(&task).await;
                }
                Err(err) => {
                    tracing::warn!(
                        task_id = %task.id,
                        task_type = task.task_type.as_str(),
                        attempt = attempts,
                        error = %err.message,
                        "compensation attempt failed"
                    );
                    let retryable = err.kind == BillingErrorKind::Internal;
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        let err = last_error
            .unwrap_or_else(|| BillingError::internal("compensation did not run"));
        self.store
            .finish(&task.id, TaskStatus::Failed, attempts, Some(&err.message))
            .await
            .map_err(BillingError::internal)?;
        Err(err)
    }

    async fn reload(&self, task: &CompensationTask) -> Result<CompensationTask, BillingError> {
        self.store
            .get_by_reference(&task.reference)
            .await
            .map_err(BillingError::internal)?
            .ok_or_else(|| BillingError::internal("compensation task disappeared"))
    }
}
