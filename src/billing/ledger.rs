//! Persistence of usage logs and billing records.
//!
//! Every monetary effect is one `billing_records` row with a unique
//! `reference`; a second write with the same reference is reported as
//! already applied instead of charging again.

use super::context::{BillingStage, NewUsageLog, RequestType};
use super::{BillingError, BillingErrorKind};
use crate::users::{parse_nano_usd, parse_rfc3339};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Usage,
    Refund,
    Correction,
    Topup,
}

impl RecordType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "usage" => Some(Self::Usage),
            "refund" => Some(Self::Refund),
            "correction" => Some(Self::Correction),
            "topup" => Some(Self::Topup),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Refund => "refund",
            Self::Correction => "correction",
            Self::Topup => "topup",
        }
    }
}

pub fn usage_reference(request_id: &str) -> String {
    format!("usage:{request_id}")
}

pub fn refund_reference(request_id: &str) -> String {
    format!("refund:{request_id}")
}

/// Operator references are only unique per user.
pub fn adjustment_reference(user_id: &str, reference: &str) -> String {
    format!("adjustment:{user_id}:{reference}")
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageLog {
    pub id: String,
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub provider_id: Option<String>,
    pub provider_name: Option<String>,
    pub request_type: RequestType,
    pub method: String,
    pub endpoint: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_used: Option<f64>,
    pub estimated_cost_nano: Option<i128>,
    pub actual_cost_nano: Option<i128>,
    pub status_code: u16,
    pub success: bool,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub stage: BillingStage,
    pub is_billed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingRecord {
    pub id: String,
    pub user_id: String,
    pub usage_log_id: Option<String>,
    pub request_id: Option<String>,
    pub record_type: RecordType,
    /// Signed; debits are negative.
    pub amount_nano_usd: i128,
    pub balance_after_nano_usd: Option<i128>,
    pub reference: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// One monetary effect to apply.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: String,
    pub record_type: RecordType,
    pub amount_nano_usd: i128,
    pub reference: String,
    pub description: String,
    pub usage_log_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LedgerOutcome {
    Applied(BillingRecord),
    AlreadyApplied(BillingRecord),
}

impl LedgerOutcome {
    pub fn record(&self) -> &BillingRecord {
        match self {
            Self::Applied(record) | Self::AlreadyApplied(record) => record,
        }
    }
}

const USAGE_LOG_COLUMNS: &str = "id, request_id, user_id, api_key_id, model, provider_id, \
    provider_name, request_type, method, endpoint, input_tokens, output_tokens, total_tokens, \
    cost_used, estimated_cost_nano, actual_cost_nano, status_code, success, duration_ms, \
    error_message, stage, is_billed, created_at, updated_at";

const RECORD_COLUMNS: &str = "id, user_id, usage_log_id, request_id, record_type, \
    amount_nano_usd, balance_after_nano_usd, reference, description, created_at";

#[derive(Clone)]
pub struct LedgerStore {
    pool: Pool<Sqlite>,
}

impl LedgerStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_logs (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                model TEXT NOT NULL,
                provider_id TEXT,
                provider_name TEXT,
                request_type TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT 'POST',
                endpoint TEXT NOT NULL DEFAULT '',
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                cost_used REAL,
                estimated_cost_nano TEXT,
                actual_cost_nano TEXT,
                status_code INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                stage TEXT NOT NULL,
                is_billed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_unbilled ON usage_logs(is_billed, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS billing_records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                usage_log_id TEXT,
                request_id TEXT,
                record_type TEXT NOT NULL CHECK (record_type IN ('usage', 'refund', 'correction', 'topup')),
                amount_nano_usd TEXT NOT NULL,
                balance_after_nano_usd TEXT,
                reference TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_billing_records_user ON billing_records(user_id, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, Sqlite>, BillingError> {
        self.pool
            .begin()
            .await
            .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))
    }

    /// Inserts the log, or returns the existing one for the same request id.
    pub async fn insert_usage_log(&self, log: &NewUsageLog) -> Result<UsageLog, String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT OR IGNORE INTO usage_logs (id, request_id, user_id, api_key_id, model,
                    provider_id, provider_name, request_type, method, endpoint, input_tokens,
                    output_tokens, total_tokens, cost_used, estimated_cost_nano, status_code,
                    success, duration_ms, error_message, stage, is_billed, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&log.request_id)
        .bind(&log.user_id)
        .bind(&log.api_key_id)
        .bind(&log.model)
        .bind(&log.provider_id)
        .bind(&log.provider_name)
        .bind(log.request_type.as_str())
        .bind(&log.method)
        .bind(&log.endpoint)
        .bind(to_i64(log.input_tokens))
        .bind(to_i64(log.output_tokens))
        .bind(to_i64(log.total_tokens))
        .bind(log.cost_used)
        .bind(log.estimated_cost_nano.map(|v| v.to_string()))
        .bind(i64::from(log.status_code))
        .bind(if log.success { 1 } else { 0 })
        .bind(to_i64(log.duration_ms))
        .bind(&log.error_message)
        .bind(log.stage.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_usage_log_by_request_id(&log.request_id)
            .await?
            .ok_or_else(|| "usage log not found after insert".to_string())
    }

    pub async fn get_usage_log(&self, id: &str) -> Result<Option<UsageLog>, String> {
        let sql = format!("SELECT {USAGE_LOG_COLUMNS} FROM usage_logs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_usage_log(&row)).transpose()
    }

    pub async fn get_usage_log_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<UsageLog>, String> {
        let sql = format!("SELECT {USAGE_LOG_COLUMNS} FROM usage_logs WHERE request_id = ?");
        let row = sqlx::query(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_usage_log(&row)).transpose()
    }

    pub async fn set_stage(
        &self,
        usage_log_id: &str,
        stage: BillingStage,
        error_message: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE usage_logs
               SET stage = ?, error_message = COALESCE(?, error_message), updated_at = ?
               WHERE id = ?"#,
        )
        .bind(stage.as_str())
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(usage_log_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Records the final outcome of an async job on its pending log.
    pub async fn record_outcome(
        &self,
        usage_log_id: &str,
        success: bool,
        status_code: u16,
        error_message: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE usage_logs
               SET success = ?, status_code = ?, error_message = ?, duration_ms = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(if success { 1 } else { 0 })
        .bind(i64::from(status_code))
        .bind(error_message)
        .bind(to_i64(duration_ms))
        .bind(Utc::now().to_rfc3339())
        .bind(usage_log_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn mark_billed_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        usage_log_id: &str,
        actual_cost_nano: i128,
    ) -> Result<(), BillingError> {
        sqlx::query(
            r#"UPDATE usage_logs
               SET is_billed = 1, stage = 'processed', actual_cost_nano = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(actual_cost_nano.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(usage_log_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))?;
        Ok(())
    }

    pub async fn mark_billed(
        &self,
        usage_log_id: &str,
        actual_cost_nano: i128,
    ) -> Result<(), BillingError> {
        let mut tx = self.begin().await?;
        self.mark_billed_tx(&mut tx, usage_log_id, actual_cost_nano)
            .await?;
        tx.commit()
            .await
            .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))
    }

    /// Clears the billed flag so the unbilled pass picks the log up again.
    pub async fn reset_unbilled(&self, usage_log_id: &str) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE usage_logs SET is_billed = 0, stage = 'error', updated_at = ?
               WHERE id = ?"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(usage_log_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Successful, unbilled logs in the window that are not awaiting an async
    /// completion and were not deliberately left unbilled.
    pub async fn list_unbilled_usage_logs(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, String> {
        let sql = format!(
            r#"SELECT {USAGE_LOG_COLUMNS} FROM usage_logs
               WHERE is_billed = 0 AND success = 1 AND status_code >= 200 AND status_code < 300
                 AND stage NOT IN ('pending', 'log_only', 'refunded')
                 AND created_at >= ?
               ORDER BY created_at ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_usage_log).collect()
    }

    /// Async usage logs still waiting for their job to settle.
    pub async fn list_pending_usage_logs(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, String> {
        let sql = format!(
            r#"SELECT {USAGE_LOG_COLUMNS} FROM usage_logs
               WHERE is_billed = 0 AND stage = 'pending' AND created_at >= ?
               ORDER BY created_at ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_usage_log).collect()
    }

    /// Usage records whose log is not flagged as billed.
    pub async fn list_records_with_unbilled_log(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(BillingRecord, UsageLog)>, String> {
        let sql = format!(
            r#"SELECT {RECORD_COLUMNS} FROM billing_records
               WHERE record_type = 'usage' AND usage_log_id IS NOT NULL AND created_at >= ?
               ORDER BY created_at ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let mut out = Vec::new();
        for row in &rows {
            let record = row_to_record(row)?;
            let Some(log_id) = record.usage_log_id.as_deref() else {
                continue;
            };
            if let Some(log) = self.get_usage_log(log_id).await? {
                if !log.is_billed {
                    out.push((record, log));
                }
            }
        }
        Ok(out)
    }

    /// Logs flagged as billed that have no usage record.
    pub async fn list_billed_logs_without_record(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageLog>, String> {
        let sql = format!(
            r#"SELECT {USAGE_LOG_COLUMNS} FROM usage_logs
               WHERE is_billed = 1 AND created_at >= ?
                 AND NOT EXISTS (
                     SELECT 1 FROM billing_records br
                     WHERE br.reference = 'usage:' || usage_logs.request_id
                 )
               ORDER BY created_at ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_usage_log).collect()
    }

    pub async fn count_usage_logs_since(&self, since: DateTime<Utc>) -> Result<i64, String> {
        sqlx::query_scalar("SELECT COUNT(*) FROM usage_logs WHERE created_at >= ?")
            .bind(since.to_rfc3339())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn find_record_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BillingRecord>, String> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM billing_records WHERE reference = ?");
        let row = sqlx::query(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_record(&row)).transpose()
    }

    pub async fn list_records_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<BillingRecord>, String> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM billing_records WHERE request_id = ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(request_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn list_records_for_user(&self, user_id: &str) -> Result<Vec<BillingRecord>, String> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM billing_records WHERE user_id = ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn list_users_with_records_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, String> {
        sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM billing_records WHERE created_at >= ? ORDER BY user_id",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())
    }

    /// Sum of every record amount for the user, in nano-USD.
    pub async fn sum_records_for_user(&self, user_id: &str) -> Result<i128, String> {
        let amounts: Vec<String> =
            sqlx::query_scalar("SELECT amount_nano_usd FROM billing_records WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        amounts.iter().try_fold(0i128, |acc, raw| {
            let amount = parse_nano_usd(raw)?;
            acc.checked_add(amount)
                .ok_or_else(|| "record sum overflow".to_string())
        })
    }

    /// Applies one entry: moves the balance and writes the record, inside the
    /// caller's transaction. Unlimited users get a record without a balance
    /// change. Negative resulting balances are allowed because the work being
    /// charged for has already been done.
    pub async fn apply_entry_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        entry: &LedgerEntry,
    ) -> Result<LedgerOutcome, BillingError> {
        let existing_sql =
            format!("SELECT {RECORD_COLUMNS} FROM billing_records WHERE reference = ?");
        let existing = sqlx::query(&existing_sql)
            .bind(&entry.reference)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))?;
        if let Some(row) = existing {
            let record = row_to_record(&row)
                .map_err(|e| BillingError::new(BillingErrorKind::Internal, e))?;
            return Ok(LedgerOutcome::AlreadyApplied(record));
        }

        let row = sqlx::query("SELECT balance_nano_usd, balance_unlimited FROM users WHERE id = ?")
            .bind(&entry.user_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))?;
        let Some(row) = row else {
            return Err(BillingError::new(
                BillingErrorKind::NotFound,
                "user not found",
            ));
        };
        let unlimited = row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1;
        let now = Utc::now();

        let balance_after = if unlimited {
            None
        } else {
            let balance_raw: String = row
                .try_get("balance_nano_usd")
                .unwrap_or_else(|_| "0".to_string());
            let balance = parse_nano_usd(&balance_raw)
                .map_err(|e| BillingError::new(BillingErrorKind::InvalidStoredBalance, e))?;
            let next_balance = balance.checked_add(entry.amount_nano_usd).ok_or_else(|| {
                BillingError::new(BillingErrorKind::Overflow, "balance update overflow")
            })?;
            sqlx::query("UPDATE users SET balance_nano_usd = ?, updated_at = ? WHERE id = ?")
                .bind(next_balance.to_string())
                .bind(now.to_rfc3339())
                .bind(&entry.user_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))?;
            Some(next_balance)
        };

        let record = BillingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: entry.user_id.clone(),
            usage_log_id: entry.usage_log_id.clone(),
            request_id: entry.request_id.clone(),
            record_type: entry.record_type,
            amount_nano_usd: entry.amount_nano_usd,
            balance_after_nano_usd: balance_after,
            reference: entry.reference.clone(),
            description: entry.description.clone(),
            created_at: now,
        };
        let inserted = sqlx::query(
            r#"INSERT INTO billing_records (id, user_id, usage_log_id, request_id, record_type,
                                            amount_nano_usd, balance_after_nano_usd, reference,
                                            description, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.usage_log_id)
        .bind(&record.request_id)
        .bind(record.record_type.as_str())
        .bind(record.amount_nano_usd.to_string())
        .bind(record.balance_after_nano_usd.map(|v| v.to_string()))
        .bind(&record.reference)
        .bind(&record.description)
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await;
        match inserted {
            Ok(_) => Ok(LedgerOutcome::Applied(record)),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                // lost a race on the reference; the caller must not commit
                Ok(LedgerOutcome::AlreadyApplied(record))
            }
            Err(err) => Err(BillingError::new(
                BillingErrorKind::Internal,
                err.to_string(),
            )),
        }
    }

    /// Applies a standalone entry in its own transaction.
    pub async fn apply_entry(&self, entry: &LedgerEntry) -> Result<LedgerOutcome, BillingError> {
        let mut tx = self.begin().await?;
        let outcome = self.apply_entry_tx(&mut tx, entry).await?;
        if let LedgerOutcome::Applied(_) = outcome {
            tx.commit()
                .await
                .map_err(|e| BillingError::new(BillingErrorKind::Internal, e.to_string()))?;
        }
        Ok(outcome)
    }

    /// Adds funds. Writes a `topup` record so record sums track balances.
    pub async fn credit_balance(
        &self,
        user_id: &str,
        amount_nano_usd: i128,
        description: &str,
    ) -> Result<BillingRecord, BillingError> {
        if amount_nano_usd <= 0 {
            return Err(BillingError::new(
                BillingErrorKind::InvalidRequest,
                "top-up amount must be positive",
            ));
        }
        let entry = LedgerEntry {
            user_id: user_id.to_string(),
            record_type: RecordType::Topup,
            amount_nano_usd,
            reference: format!("topup:{}", uuid::Uuid::new_v4()),
            description: description.to_string(),
            usage_log_id: None,
            request_id: None,
        };
        Ok(self.apply_entry(&entry).await?.record().clone())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_usage_log(row: &sqlx::sqlite::SqliteRow) -> Result<UsageLog, String> {
    let request_type_raw: String = row.try_get("request_type").map_err(|e| e.to_string())?;
    let stage_raw: String = row.try_get("stage").map_err(|e| e.to_string())?;
    let nano = |column: &str| -> Result<Option<i128>, String> {
        let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
        raw.map(|v| parse_nano_usd(&v)).transpose()
    };
    let count = |column: &str| -> Result<u64, String> {
        let v: i64 = row.try_get(column).map_err(|e| e.to_string())?;
        Ok(u64::try_from(v).unwrap_or(0))
    };
    let status_code: i64 = row.try_get("status_code").map_err(|e| e.to_string())?;
    Ok(UsageLog {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        request_id: row.try_get("request_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        api_key_id: row.try_get("api_key_id").map_err(|e| e.to_string())?,
        model: row.try_get("model").map_err(|e| e.to_string())?,
        provider_id: row.try_get("provider_id").map_err(|e| e.to_string())?,
        provider_name: row.try_get("provider_name").map_err(|e| e.to_string())?,
        request_type: RequestType::from_str(&request_type_raw)
            .ok_or_else(|| format!("invalid request type: {request_type_raw}"))?,
        method: row.try_get("method").map_err(|e| e.to_string())?,
        endpoint: row.try_get("endpoint").map_err(|e| e.to_string())?,
        input_tokens: count("input_tokens")?,
        output_tokens: count("output_tokens")?,
        total_tokens: count("total_tokens")?,
        cost_used: row.try_get("cost_used").map_err(|e| e.to_string())?,
        estimated_cost_nano: nano("estimated_cost_nano")?,
        actual_cost_nano: nano("actual_cost_nano")?,
        status_code: u16::try_from(status_code).unwrap_or(0),
        success: row.try_get::<i32, _>("success").map_err(|e| e.to_string())? == 1,
        duration_ms: count("duration_ms")?,
        error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
        stage: BillingStage::from_str(&stage_raw)
            .ok_or_else(|| format!("invalid billing stage: {stage_raw}"))?,
        is_billed: row.try_get::<i32, _>("is_billed").map_err(|e| e.to_string())? == 1,
        created_at: parse_rfc3339(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        updated_at: parse_rfc3339(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
    })
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<BillingRecord, String> {
    let type_raw: String = row.try_get("record_type").map_err(|e| e.to_string())?;
    let amount_raw: String = row.try_get("amount_nano_usd").map_err(|e| e.to_string())?;
    let balance_after_raw: Option<String> = row
        .try_get("balance_after_nano_usd")
        .map_err(|e| e.to_string())?;
    Ok(BillingRecord {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        usage_log_id: row.try_get("usage_log_id").map_err(|e| e.to_string())?,
        request_id: row.try_get("request_id").map_err(|e| e.to_string())?,
        record_type: RecordType::from_str(&type_raw)
            .ok_or_else(|| format!("invalid record type: {type_raw}"))?,
        amount_nano_usd: parse_nano_usd(&amount_raw)?,
        balance_after_nano_usd: balance_after_raw
            .map(|v| parse_nano_usd(&v))
            .transpose()?,
        reference: row.try_get("reference").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(row.try_get("created_at").map_err(|e| e.to_string())?)?,
    })
}
