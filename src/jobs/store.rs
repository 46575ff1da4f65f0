use super::model::{Job, JobAction, JobMode, JobStatus, JobSubmission};
use crate::billing::{JobOutcome, JobOutcomeSource};
use crate::users::parse_rfc3339;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

const JOB_COLUMNS: &str = "job_id, user_id, api_key_id, action, status, mode, parent_job_id, \
    prompt, request_params, upstream_task_id, provider_id, progress, image_url, buttons, \
    error_message, timeout_secs, poll_attempts, created_at, started_at, completed_at, updated_at";

/// Job persistence. Every status change is a guarded `UPDATE` that only
/// matches allowed predecessor states, so status never regresses and one
/// caller wins each transition.
#[derive(Clone)]
pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending_queue', 'on_queue', 'success', 'failed')),
                mode TEXT NOT NULL DEFAULT 'fast',
                parent_job_id TEXT,
                prompt TEXT,
                request_params TEXT NOT NULL DEFAULT '{}',
                upstream_task_id TEXT,
                provider_id TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                image_url TEXT,
                buttons TEXT,
                error_message TEXT,
                timeout_secs INTEGER NOT NULL DEFAULT 300,
                poll_attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_upstream ON jobs(upstream_task_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn insert(
        &self,
        job_id: &str,
        user_id: &str,
        api_key_id: &str,
        submission: &JobSubmission,
    ) -> Result<Job, String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO jobs (job_id, user_id, api_key_id, action, status, mode, parent_job_id,
                                 prompt, request_params, timeout_secs, created_at, updated_at)
               VALUES (?, ?, ?, ?, 'pending_queue', ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job_id)
        .bind(user_id)
        .bind(api_key_id)
        .bind(submission.action.as_str())
        .bind(submission.mode.as_str())
        .bind(&submission.parent_job_id)
        .bind(&submission.prompt)
        .bind(submission.request_params.to_string())
        .bind(submission.mode.default_timeout_secs())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        self.get(job_id)
            .await?
            .ok_or_else(|| "job not found after insert".to_string())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, String> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_job(&row)).transpose()
    }

    pub async fn get_by_upstream_task(&self, upstream_task_id: &str) -> Result<Option<Job>, String> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE upstream_task_id = ?");
        let row = sqlx::query(&sql)
            .bind(upstream_task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_job(&row)).transpose()
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, String> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY created_at ASC");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_job).collect()
    }

    /// `pending_queue → on_queue`.
    pub async fn mark_on_queue(
        &self,
        job_id: &str,
        upstream_task_id: &str,
        provider_id: &str,
    ) -> Result<bool, String> {
        let now = Utc::now().to_rfc3339();
        let res = sqlx::query(
            r#"UPDATE jobs
               SET status = 'on_queue', upstream_task_id = ?, provider_id = ?, started_at = ?,
                   updated_at = ?
               WHERE job_id = ? AND status = 'pending_queue'"#,
        )
        .bind(upstream_task_id)
        .bind(provider_id)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(res.rows_affected() == 1)
    }

    /// Progress only moves forward.
    pub async fn update_progress(&self, job_id: &str, progress: i64) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE jobs SET progress = ?, updated_at = ?
               WHERE job_id = ? AND status = 'on_queue' AND progress < ?"#,
        )
        .bind(progress.clamp(0, 100))
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .bind(progress.clamp(0, 100))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn increment_poll_attempts(&self, job_id: &str) -> Result<i64, String> {
        sqlx::query_scalar(
            r#"UPDATE jobs SET poll_attempts = poll_attempts + 1, updated_at = ?
               WHERE job_id = ?
               RETURNING poll_attempts"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())
    }

    /// Non-terminal → `success`. Returns false when another caller already
    /// finished the job.
    pub async fn complete_success(
        &self,
        job_id: &str,
        image_url: Option<&str>,
        buttons: &Value,
    ) -> Result<bool, String> {
        let now = Utc::now().to_rfc3339();
        let res = sqlx::query(
            r#"UPDATE jobs
               SET status = 'success', progress = 100, image_url = ?, buttons = ?,
                   completed_at = ?, updated_at = ?
               WHERE job_id = ? AND status IN ('pending_queue', 'on_queue')"#,
        )
        .bind(image_url)
        .bind(buttons.to_string())
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(res.rows_affected() == 1)
    }

    /// Non-terminal → `failed`.
    pub async fn complete_failure(&self, job_id: &str, reason: &str) -> Result<bool, String> {
        let now = Utc::now().to_rfc3339();
        let res = sqlx::query(
            r#"UPDATE jobs
               SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
               WHERE job_id = ? AND status IN ('pending_queue', 'on_queue')"#,
        )
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, String> {
        let mut expired = self.list_by_status(JobStatus::PendingQueue).await?;
        expired.extend(self.list_by_status(JobStatus::OnQueue).await?);
        expired.retain(|job| job.is_expired(now));
        Ok(expired)
    }
}

#[async_trait]
impl JobOutcomeSource for JobStore {
    async fn terminal_outcome(&self, job_id: &str) -> Result<Option<JobOutcome>, String> {
        Ok(self
            .get(job_id)
            .await?
            .filter(|job| job.status.is_terminal())
            .map(|job| JobOutcome {
                success: job.status == JobStatus::Success,
                reason: job.error_message,
            }))
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, String> {
    let action_raw: String = row.try_get("action").map_err(|e| e.to_string())?;
    let status_raw: String = row.try_get("status").map_err(|e| e.to_string())?;
    let mode_raw: String = row.try_get("mode").map_err(|e| e.to_string())?;
    let params_raw: String = row.try_get("request_params").map_err(|e| e.to_string())?;
    let buttons_raw: Option<String> = row.try_get("buttons").map_err(|e| e.to_string())?;
    let optional_time = |column: &str| -> Result<Option<DateTime<Utc>>, String> {
        let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
        raw.map(parse_rfc3339).transpose()
    };
    Ok(Job {
        job_id: row.try_get("job_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        api_key_id: row.try_get("api_key_id").map_err(|e| e.to_string())?,
        action: JobAction::from_str(&action_raw)
            .ok_or_else(|| format!("invalid job action: {action_raw}"))?,
        status: JobStatus::from_str(&status_raw)
            .ok_or_else(|| format!("invalid job status: {status_raw}"))?,
        mode: JobMode::from_str(&mode_raw).unwrap_or_default(),
        parent_job_id: row.try_get("parent_job_id").map_err(|e| e.to_string())?,
        prompt: row.try_get("prompt").map_err(|e| e.to_string())?,
        request_params: serde_json::from_str(&params_raw).unwrap_or(Value::Null),
        upstream_task_id: row.try_get("upstream_task_id").map_err(|e| e.to_string())?,
        provider_id: row.try_get("provider_id").map_err(|e| e.to_string())?,
        progress: row.try_get("progress").map_err(|e| e.to_string())?,
        image_url: row.try_get("image_url").map_err(|e| e.to_string())?,
        buttons: buttons_raw
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null),
        error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
        timeout_secs: row.try_get("timeout_secs").map_err(|e| e.to_string())?,
        poll_attempts: row.try_get("poll_attempts").map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        started_at: optional_time("started_at")?,
        completed_at: optional_time("completed_at")?,
        updated_at: parse_rfc3339(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
    })
}
