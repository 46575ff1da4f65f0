use super::audit::AuditLogger;
use super::context::{BillingContext, BillingStage};
use super::ledger::{LedgerEntry, LedgerOutcome, LedgerStore, RecordType, UsageLog, usage_reference};
use super::pricing::PricingStore;
use super::quota::{QuotaStore, QuotaUsageDelta};
use super::{BillingError, BillingErrorKind};
use crate::users::UserStore;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PreCheckDecision {
    Proceed,
    Reject { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PreCheckResult {
    pub decision: PreCheckDecision,
    pub estimated_cost_nano: i128,
}

impl PreCheckResult {
    pub fn allowed(&self) -> bool {
        self.decision == PreCheckDecision::Proceed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingResult {
    pub usage_log_id: String,
    pub request_id: String,
    pub stage: BillingStage,
    pub cost_nano: i128,
    pub balance_after_nano: Option<i128>,
    /// True when a charge exists for the request, whether written now or earlier.
    pub billed: bool,
    pub already_billed: bool,
}

impl BillingResult {
    fn unbilled(log: &UsageLog, stage: BillingStage) -> Self {
        Self {
            usage_log_id: log.id.clone(),
            request_id: log.request_id.clone(),
            stage,
            cost_nano: 0,
            balance_after_nano: None,
            billed: false,
            already_billed: false,
        }
    }

    fn previously_billed(log: &UsageLog) -> Self {
        Self {
            usage_log_id: log.id.clone(),
            request_id: log.request_id.clone(),
            stage: BillingStage::Processed,
            cost_nano: log.actual_cost_nano.unwrap_or(0),
            balance_after_nano: None,
            billed: true,
            already_billed: true,
        }
    }
}

/// Pre-check, commit and async completion over the billing stores.
#[derive(Clone)]
pub struct BillingManager {
    users: UserStore,
    ledger: LedgerStore,
    pricing: PricingStore,
    quotas: QuotaStore,
    audit: AuditLogger,
}

impl BillingManager {
    pub fn new(
        users: UserStore,
        ledger: LedgerStore,
        pricing: PricingStore,
        quotas: QuotaStore,
        audit: AuditLogger,
    ) -> Self {
        Self {
            users,
            ledger,
            pricing,
            quotas,
            audit,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Checks balance and quota headroom for an estimated cost. Never mutates
    /// balances or counters.
    pub async fn pre_check(
        &self,
        ctx: &mut BillingContext,
        estimated_input_tokens: u64,
    ) -> Result<PreCheckResult, BillingError> {
        self.audit.precheck_start(
            &ctx.request_id,
            &ctx.user_id,
            &ctx.model_slug,
            estimated_input_tokens,
        );
        let result = self.evaluate_pre_check(ctx, estimated_input_tokens).await;
        match &result {
            Ok(outcome) => {
                ctx.estimated_cost_nano = Some(outcome.estimated_cost_nano);
                let reason = match &outcome.decision {
                    PreCheckDecision::Proceed => None,
                    PreCheckDecision::Reject { reason } => Some(reason.as_str()),
                };
                self.audit.precheck_result(
                    &ctx.request_id,
                    &ctx.user_id,
                    outcome.allowed(),
                    reason,
                    outcome.estimated_cost_nano,
                );
            }
            Err(err) => self
                .audit
                .precheck_error(&ctx.request_id, &ctx.user_id, &err.message),
        }
        result
    }

    async fn evaluate_pre_check(
        &self,
        ctx: &BillingContext,
        estimated_input_tokens: u64,
    ) -> Result<PreCheckResult, BillingError> {
        let pricing = self.pricing.require_pricing(&ctx.model_slug).await?;
        let estimated_cost_nano =
            pricing.cost_nano(ctx.request_type, estimated_input_tokens, 0)?;

        let balance = self
            .users
            .get_user_balance(&ctx.user_id)
            .await
            .map_err(BillingError::internal)?
            .ok_or_else(|| BillingError::new(BillingErrorKind::NotFound, "user not found"))?;
        if !balance.balance_unlimited && balance.balance_nano_usd < estimated_cost_nano {
            return Ok(PreCheckResult {
                decision: PreCheckDecision::Reject {
                    reason: "insufficient_balance".to_string(),
                },
                estimated_cost_nano,
            });
        }

        let delta = QuotaUsageDelta {
            requests: 1,
            tokens: i64::try_from(estimated_input_tokens).unwrap_or(i64::MAX),
            cost_nano: i64::try_from(estimated_cost_nano).unwrap_or(i64::MAX),
        };
        match self
            .quotas
            .find_exceeded(&ctx.api_key_id, delta, Utc::now())
            .await
        {
            Ok(Some(quota_type)) => {
                return Ok(PreCheckResult {
                    decision: PreCheckDecision::Reject {
                        reason: format!("{}_quota_exceeded", quota_type.as_str()),
                    },
                    estimated_cost_nano,
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    api_key_id = %ctx.api_key_id,
                    error = %err,
                    "quota lookup failed; allowing request"
                );
            }
        }

        Ok(PreCheckResult {
            decision: PreCheckDecision::Proceed,
            estimated_cost_nano,
        })
    }

    /// Persists the usage log and, when the outcome is billable, applies the
    /// charge as one transaction. Safe to call again for the same request id.
    pub async fn commit(&self, ctx: &mut BillingContext) -> Result<BillingResult, BillingError> {
        let billable = ctx.should_bill();
        if !billable && ctx.stage != BillingStage::Pending {
            ctx.stage = BillingStage::LogOnly;
        }
        self.audit.billing_start(
            &ctx.request_id,
            &ctx.user_id,
            &ctx.model_slug,
            ctx.stage.as_str(),
        );

        let log = match self.ledger.insert_usage_log(&ctx.to_usage_log()).await {
            Ok(log) => log,
            Err(err) => {
                let err = BillingError::internal(err);
                self.audit
                    .billing_error(&ctx.request_id, &ctx.user_id, &err.message);
                return Err(err);
            }
        };

        if log.is_billed {
            ctx.is_billed = true;
            ctx.stage = BillingStage::Processed;
            self.audit.billing_result(
                &ctx.request_id,
                &ctx.user_id,
                log.actual_cost_nano.unwrap_or(0),
                None,
                true,
            );
            return Ok(BillingResult::previously_billed(&log));
        }
        if !billable {
            self.audit
                .billing_result(&ctx.request_id, &ctx.user_id, 0, None, false);
            return Ok(BillingResult::unbilled(&log, ctx.stage));
        }

        let result = self.charge_usage_log(&log).await?;
        ctx.is_billed = true;
        ctx.stage = BillingStage::Processed;
        ctx.actual_cost_nano = Some(result.cost_nano);
        Ok(result)
    }

    /// Writes the usage log for a submitted async job. No charge happens
    /// until the job completes.
    pub async fn record_async_submission(
        &self,
        ctx: &mut BillingContext,
    ) -> Result<UsageLog, BillingError> {
        ctx.stage = BillingStage::Pending;
        self.audit.billing_start(
            &ctx.request_id,
            &ctx.user_id,
            &ctx.model_slug,
            ctx.stage.as_str(),
        );
        self.ledger
            .insert_usage_log(&ctx.to_usage_log())
            .await
            .map_err(BillingError::internal)
    }

    /// Settles an async job. Redelivery is expected, so a log that is already
    /// billed is a successful no-op.
    pub async fn process_async_completion(
        &self,
        request_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<BillingResult, BillingError> {
        self.audit.async_completion_start(request_id, success);
        let log = self
            .ledger
            .get_usage_log_by_request_id(request_id)
            .await
            .map_err(BillingError::internal)?
            .ok_or_else(|| {
                BillingError::new(
                    BillingErrorKind::NotFound,
                    format!("usage log not found for request {request_id}"),
                )
            })?;

        if log.is_billed {
            self.audit
                .async_completion_result(request_id, &log.user_id, "already_billed");
            return Ok(BillingResult::previously_billed(&log));
        }

        let duration_ms = (Utc::now() - log.created_at).num_milliseconds().max(0) as u64;
        if !success {
            if log.stage != BillingStage::Error {
                self.ledger
                    .record_outcome(&log.id, false, 500, error_message, duration_ms)
                    .await
                    .map_err(BillingError::internal)?;
                self.ledger
                    .set_stage(&log.id, BillingStage::Error, error_message)
                    .await
                    .map_err(BillingError::internal)?;
            }
            self.audit
                .async_completion_result(request_id, &log.user_id, "failed_not_billed");
            return Ok(BillingResult::unbilled(&log, BillingStage::Error));
        }

        self.ledger
            .record_outcome(&log.id, true, 200, None, duration_ms)
            .await
            .map_err(BillingError::internal)?;
        let result = self.charge_usage_log(&log).await?;
        self.audit
            .async_completion_result(request_id, &log.user_id, "billed");
        Ok(result)
    }

    pub async fn cost_for_log(&self, log: &UsageLog) -> Result<i128, BillingError> {
        let pricing = self.pricing.require_pricing(&log.model).await?;
        pricing.cost_nano(log.request_type, log.input_tokens, log.output_tokens)
    }

    /// The single charge path shared by commit, async completion and
    /// compensation. The `usage:{request_id}` reference makes it idempotent.
    pub async fn charge_usage_log(&self, log: &UsageLog) -> Result<BillingResult, BillingError> {
        let outcome = self.apply_charge(log).await;
        match outcome {
            Ok(result) => {
                self.audit.billing_result(
                    &log.request_id,
                    &log.user_id,
                    result.cost_nano,
                    result.balance_after_nano,
                    result.already_billed,
                );
                Ok(result)
            }
            Err(err) => {
                tracing::error!(
                    request_id = %log.request_id,
                    usage_log_id = %log.id,
                    error = %err.message,
                    "billing commit failed; left for consistency repair"
                );
                if let Err(stage_err) = self
                    .ledger
                    .set_stage(&log.id, BillingStage::Error, Some(&err.message))
                    .await
                {
                    tracing::warn!(usage_log_id = %log.id, error = %stage_err, "failed to mark usage log as errored");
                }
                self.audit
                    .billing_error(&log.request_id, &log.user_id, &err.message);
                Err(err)
            }
        }
    }

    async fn apply_charge(&self, log: &UsageLog) -> Result<BillingResult, BillingError> {
        let cost_nano = self.cost_for_log(log).await?;
        let entry = LedgerEntry {
            user_id: log.user_id.clone(),
            record_type: RecordType::Usage,
            amount_nano_usd: -cost_nano,
            reference: usage_reference(&log.request_id),
            description: format!("{} {}", log.request_type.as_str(), log.model),
            usage_log_id: Some(log.id.clone()),
            request_id: Some(log.request_id.clone()),
        };

        let mut tx = self.ledger.begin().await?;
        let record = match self.ledger.apply_entry_tx(&mut tx, &entry).await? {
            LedgerOutcome::Applied(record) => record,
            LedgerOutcome::AlreadyApplied(record) => {
                drop(tx);
                self.ledger
                    .mark_billed(&log.id, -record.amount_nano_usd)
                    .await?;
                return Ok(BillingResult {
                    usage_log_id: log.id.clone(),
                    request_id: log.request_id.clone(),
                    stage: BillingStage::Processed,
                    cost_nano: -record.amount_nano_usd,
                    balance_after_nano: record.balance_after_nano_usd,
                    billed: true,
                    already_billed: true,
                });
            }
        };

        let delta = QuotaUsageDelta {
            requests: 1,
            tokens: i64::try_from(log.total_tokens).unwrap_or(i64::MAX),
            cost_nano: i64::try_from(cost_nano).unwrap_or(i64::MAX),
        };
        let consumed = self
            .quotas
            .consume_tx(&mut tx, &log.api_key_id, delta, Utc::now())
            .await
            .map_err(BillingError::internal)?;
        self.ledger.mark_billed_tx(&mut tx, &log.id, cost_nano).await?;
        tx.commit()
            .await
            .map_err(|e| BillingError::internal(e.to_string()))?;

        for (quota, amount) in &consumed {
            self.audit.quota_consumption(
                &log.request_id,
                &quota.id,
                quota.quota_type.as_str(),
                *amount,
            );
        }
        tracing::debug!(
            request_id = %log.request_id,
            cost_nano = %cost_nano,
            "usage charged"
        );
        Ok(BillingResult {
            usage_log_id: log.id.clone(),
            request_id: log.request_id.clone(),
            stage: BillingStage::Processed,
            cost_nano,
            balance_after_nano: record.balance_after_nano_usd,
            billed: true,
            already_billed: false,
        })
    }
}
