//! Reconciliation between usage logs, billing records and balances.

use super::audit::AuditLogger;
use super::compensation::CompensationService;
use super::ledger::LedgerStore;
use super::BillingError;
use crate::users::UserStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

pub const CHECK_PENDING_JOBS: &str = "async_job_settlement";
pub const CHECK_UNBILLED: &str = "unbilled_usage_logs";
pub const CHECK_RECORDS: &str = "billing_record_consistency";
pub const CHECK_BALANCES: &str = "user_balance_consistency";

/// Final state of an async job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

/// Where the checker learns how async jobs ended, so a pending usage log
/// whose settlement was lost can still be billed or closed.
#[async_trait]
pub trait JobOutcomeSource: Send + Sync {
    /// `None` while the job is unknown or still running.
    async fn terminal_outcome(&self, job_id: &str) -> Result<Option<JobOutcome>, String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub request_id: Option<String>,
    pub usage_log_id: Option<String>,
    pub user_id: Option<String>,
    pub description: String,
    pub data: Value,
    pub fixed: bool,
    pub fix_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckResult {
    pub total_checked: usize,
    pub inconsistent_count: usize,
    pub fixed_count: usize,
    pub error_count: usize,
    pub issues: Vec<ConsistencyIssue>,
}

impl CheckResult {
    fn push(&mut self, issue: ConsistencyIssue) {
        self.inconsistent_count += 1;
        if issue.fixed {
            self.fixed_count += 1;
        }
        if issue.fix_error.is_some() {
            self.error_count += 1;
        }
        self.issues.push(issue);
    }

    fn failed(check: &str, err: &BillingError) -> Self {
        Self {
            error_count: 1,
            issues: vec![ConsistencyIssue {
                issue_type: format!("{check}_failed"),
                request_id: None,
                usage_log_id: None,
                user_id: None,
                description: err.message.clone(),
                data: Value::Null,
                fixed: false,
                fix_error: Some(err.message.clone()),
            }],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub checks: BTreeMap<String, CheckResult>,
    pub summary: String,
    pub window_hours: i64,
    pub auto_fix: bool,
    pub check_time: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ConsistencyReport {
    pub fn total_inconsistent(&self) -> usize {
        self.checks.values().map(|c| c.inconsistent_count).sum()
    }
}

#[derive(Clone)]
pub struct ConsistencyChecker {
    ledger: LedgerStore,
    users: UserStore,
    compensation: CompensationService,
    audit: AuditLogger,
    jobs: Option<Arc<dyn JobOutcomeSource>>,
}

impl ConsistencyChecker {
    pub fn new(
        ledger: LedgerStore,
        users: UserStore,
        compensation: CompensationService,
        audit: AuditLogger,
    ) -> Self {
        Self {
            ledger,
            users,
            compensation,
            audit,
            jobs: None,
        }
    }

    pub fn with_job_outcomes(mut self, jobs: Arc<dyn JobOutcomeSource>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    fn window_start(window_hours: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(window_hours.max(1))
    }

    /// Pending async logs whose job already finished: the completion never
    /// reached billing.
    pub async fn check_pending_async_jobs(
        &self,
        window_hours: i64,
        auto_fix: bool,
    ) -> Result<CheckResult, BillingError> {
        let mut result = CheckResult::default();
        let Some(jobs) = self.jobs.as_ref() else {
            return Ok(result);
        };
        let logs = self
            .ledger
            .list_pending_usage_logs(Self::window_start(window_hours))
            .await
            .map_err(BillingError::internal)?;
        result.total_checked = logs.len();
        for log in logs {
            let outcome = match jobs.terminal_outcome(&log.request_id).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(err) => {
                    result.error_count += 1;
                    tracing::warn!(request_id = %log.request_id, error = %err, "job outcome lookup failed");
                    continue;
                }
            };
            let mut issue = ConsistencyIssue {
                issue_type: "unsettled_async_job".to_string(),
                request_id: Some(log.request_id.clone()),
                usage_log_id: Some(log.id.clone()),
                user_id: Some(log.user_id.clone()),
                description: "async job finished but its usage log is still pending".to_string(),
                data: json!({
                    "model": log.model,
                    "job_succeeded": outcome.success,
                    "fail_reason": outcome.reason,
                }),
                fixed: false,
                fix_error: None,
            };
            if auto_fix {
                match self
                    .compensation
                    .settle_async_job(&log.request_id, outcome.success, outcome.reason.as_deref())
                    .await
                {
                    Ok(_) => issue.fixed = true,
                    Err(err) => issue.fix_error = Some(err.message),
                }
            }
            result.push(issue);
        }
        self.audit.consistency_check(
            CHECK_PENDING_JOBS,
            result.total_checked,
            result.inconsistent_count,
            result.fixed_count,
        );
        Ok(result)
    }

    /// Successful logs in the window with no charge applied.
    pub async fn check_unbilled_usage_logs(
        &self,
        window_hours: i64,
        auto_fix: bool,
    ) -> Result<CheckResult, BillingError> {
        let since = Self::window_start(window_hours);
        let mut result = CheckResult {
            total_checked: usize::try_from(
                self.ledger
                    .count_usage_logs_since(since)
                    .await
                    .map_err(BillingError::internal)?,
            )
            .unwrap_or(0),
            ..CheckResult::default()
        };
        let logs = self
            .ledger
            .list_unbilled_usage_logs(since)
            .await
            .map_err(BillingError::internal)?;
        for log in logs {
            let mut issue = ConsistencyIssue {
                issue_type: "unbilled_usage_log".to_string(),
                request_id: Some(log.request_id.clone()),
                usage_log_id: Some(log.id.clone()),
                user_id: Some(log.user_id.clone()),
                description: format!("successful {} request was never billed", log.request_type.as_str()),
                data: json!({
                    "model": log.model,
                    "stage": log.stage.as_str(),
                    "input_tokens": log.input_tokens,
                    "output_tokens": log.output_tokens,
                }),
                fixed: false,
                fix_error: None,
            };
            if auto_fix {
                match self.compensation.retry_missed_charge(&log.id).await {
                    Ok(_) => issue.fixed = true,
                    Err(err) => issue.fix_error = Some(err.message),
                }
            }
            result.push(issue);
        }
        self.audit.consistency_check(
            CHECK_UNBILLED,
            result.total_checked,
            result.inconsistent_count,
            result.fixed_count,
        );
        Ok(result)
    }

    /// Usage records whose log is not flagged billed, and billed logs with no
    /// usage record.
    pub async fn check_billing_record_consistency(
        &self,
        window_hours: i64,
        auto_fix: bool,
    ) -> Result<CheckResult, BillingError> {
        let since = Self::window_start(window_hours);
        let mut result = CheckResult::default();

        let orphaned = self
            .ledger
            .list_records_with_unbilled_log(since)
            .await
            .map_err(BillingError::internal)?;
        let missing = self
            .ledger
            .list_billed_logs_without_record(since)
            .await
            .map_err(BillingError::internal)?;
        result.total_checked = orphaned.len() + missing.len();

        for (record, log) in orphaned {
            let mut issue = ConsistencyIssue {
                issue_type: "record_without_billed_log".to_string(),
                request_id: Some(log.request_id.clone()),
                usage_log_id: Some(log.id.clone()),
                user_id: Some(log.user_id.clone()),
                description: "billing record exists but usage log is not marked billed".to_string(),
                data: json!({
                    "record_id": record.id,
                    "amount_nano_usd": record.amount_nano_usd.to_string(),
                }),
                fixed: false,
                fix_error: None,
            };
            if auto_fix {
                match self
                    .ledger
                    .mark_billed(&log.id, -record.amount_nano_usd)
                    .await
                {
                    Ok(()) => issue.fixed = true,
                    Err(err) => issue.fix_error = Some(err.message),
                }
            }
            result.push(issue);
        }

        for log in missing {
            let mut issue = ConsistencyIssue {
                issue_type: "billed_log_without_record".to_string(),
                request_id: Some(log.request_id.clone()),
                usage_log_id: Some(log.id.clone()),
                user_id: Some(log.user_id.clone()),
                description: "usage log is marked billed but has no billing record".to_string(),
                data: json!({ "stage": log.stage.as_str() }),
                fixed: false,
                fix_error: None,
            };
            if auto_fix {
                // the unbilled pass charges it again under the same reference
                match self.ledger.reset_unbilled(&log.id).await {
                    Ok(()) => issue.fixed = true,
                    Err(err) => issue.fix_error = Some(err),
                }
            }
            result.push(issue);
        }

        self.audit.consistency_check(
            CHECK_RECORDS,
            result.total_checked,
            result.inconsistent_count,
            result.fixed_count,
        );
        Ok(result)
    }

    /// Compares the sum of a user's billing records with the stored balance.
    /// Unlimited users are skipped.
    pub async fn check_user_balance_consistency(
        &self,
        user_id: &str,
    ) -> Result<Option<ConsistencyIssue>, BillingError> {
        let Some(balance) = self
            .users
            .get_user_balance(user_id)
            .await
            .map_err(BillingError::internal)?
        else {
            return Ok(None);
        };
        if balance.balance_unlimited {
            return Ok(None);
        }
        let expected = self
            .ledger
            .sum_records_for_user(user_id)
            .await
            .map_err(BillingError::internal)?;
        if expected == balance.balance_nano_usd {
            return Ok(None);
        }
        Ok(Some(ConsistencyIssue {
            issue_type: "balance_mismatch".to_string(),
            request_id: None,
            usage_log_id: None,
            user_id: Some(user_id.to_string()),
            description: "stored balance differs from the sum of billing records".to_string(),
            data: json!({
                "stored_nano_usd": balance.balance_nano_usd.to_string(),
                "records_sum_nano_usd": expected.to_string(),
                "difference_nano_usd": (balance.balance_nano_usd - expected).to_string(),
            }),
            fixed: false,
            fix_error: None,
        }))
    }

    async fn check_recent_balances(&self, window_hours: i64) -> Result<CheckResult, BillingError> {
        let users = self
            .ledger
            .list_users_with_records_since(Self::window_start(window_hours))
            .await
            .map_err(BillingError::internal)?;
        let mut result = CheckResult {
            total_checked: users.len(),
            ..CheckResult::default()
        };
        for user_id in users {
            match self.check_user_balance_consistency(&user_id).await {
                Ok(Some(issue)) => result.push(issue),
                Ok(None) => {}
                Err(err) => {
                    result.error_count += 1;
                    tracing::warn!(user_id = %user_id, error = %err.message, "balance check failed");
                }
            }
        }
        self.audit.consistency_check(
            CHECK_BALANCES,
            result.total_checked,
            result.inconsistent_count,
            result.fixed_count,
        );
        Ok(result)
    }

    /// Stranded async jobs first, then record consistency so that reset logs
    /// are re-billed by the unbilled pass in the same run, then balances.
    pub async fn run_full_consistency_check(
        &self,
        window_hours: i64,
        auto_fix: bool,
    ) -> ConsistencyReport {
        let started = Instant::now();
        let check_time = Utc::now();
        let mut checks = BTreeMap::new();

        let pending_jobs = self
            .check_pending_async_jobs(window_hours, auto_fix)
            .await
            .unwrap_or_else(|err| CheckResult::failed(CHECK_PENDING_JOBS, &err));
        checks.insert(CHECK_PENDING_JOBS.to_string(), pending_jobs);

        let records = self
            .check_billing_record_consistency(window_hours, auto_fix)
            .await
            .unwrap_or_else(|err| CheckResult::failed(CHECK_RECORDS, &err));
        checks.insert(CHECK_RECORDS.to_string(), records);

        let unbilled = self
            .check_unbilled_usage_logs(window_hours, auto_fix)
            .await
            .unwrap_or_else(|err| CheckResult::failed(CHECK_UNBILLED, &err));
        checks.insert(CHECK_UNBILLED.to_string(), unbilled);

        let balances = self
            .check_recent_balances(window_hours)
            .await
            .unwrap_or_else(|err| CheckResult::failed(CHECK_BALANCES, &err));
        checks.insert(CHECK_BALANCES.to_string(), balances);

        let inconsistent: usize = checks.values().map(|c| c.inconsistent_count).sum();
        let fixed: usize = checks.values().map(|c| c.fixed_count).sum();
        let errors: usize = checks.values().map(|c| c.error_count).sum();
        let summary = if inconsistent == 0 && errors == 0 {
            "no inconsistencies found".to_string()
        } else {
            format!("{inconsistent} inconsistencies, {fixed} fixed, {errors} errors")
        };
        let report = ConsistencyReport {
            checks,
            summary,
            window_hours,
            auto_fix,
            check_time,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if inconsistent > 0 || errors > 0 {
            tracing::warn!(
                inconsistent,
                fixed,
                errors,
                window_hours,
                auto_fix,
                "consistency check found issues"
            );
        } else {
            tracing::info!(window_hours, auto_fix, "consistency check clean");
        }
        report
    }
}
