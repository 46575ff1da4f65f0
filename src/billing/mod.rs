pub mod audit;
pub mod compensation;
pub mod consistency;
pub mod context;
pub mod ledger;
pub mod manager;
pub mod pricing;
pub mod quota;

use crate::error::AppError;
use axum::http::StatusCode;

pub use audit::{AuditEvent, AuditLogger, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use compensation::{CompensationService, CompensationTask};
pub use consistency::{ConsistencyChecker, ConsistencyReport, JobOutcome, JobOutcomeSource};
pub use context::{BillingContext, BillingStage, RequestType};
pub use ledger::{BillingRecord, LedgerStore, RecordType, UsageLog};
pub use manager::{BillingManager, BillingResult, PreCheckDecision, PreCheckResult};
pub use pricing::{ModelPricing, PricingStore};
pub use quota::{QuotaPeriod, QuotaStore, QuotaType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingErrorKind {
    NotFound,
    InsufficientBalance,
    InvalidStoredBalance,
    Overflow,
    PricingNotFound,
    InvalidRequest,
    Conflict,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BillingError {
    pub kind: BillingErrorKind,
    pub message: String,
}

impl BillingError {
    pub fn new(kind: BillingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::Internal, message)
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err.kind {
            BillingErrorKind::NotFound => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", err.message)
            }
            BillingErrorKind::InsufficientBalance => AppError::new(
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_balance",
                err.message,
            )
            .with_type("billing_error"),
            BillingErrorKind::PricingNotFound => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "pricing_not_found",
                err.message,
            )
            .with_type("configuration_error"),
            BillingErrorKind::InvalidRequest => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err.message)
            }
            BillingErrorKind::Conflict => {
                AppError::new(StatusCode::CONFLICT, "compensation_conflict", err.message)
            }
            BillingErrorKind::InvalidStoredBalance
            | BillingErrorKind::Overflow
            | BillingErrorKind::Internal => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "billing_failed",
                err.message,
            )
            .with_type("server_error"),
        }
    }
}
