//! Structured audit trail for every billing decision.

use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub name: &'static str,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub fields: Value,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits events on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        metrics::counter!("relaymeter_billing_events_total", "event" => event.name).increment(1);
        tracing::info!(
            target: "audit",
            event = event.name,
            request_id = event.request_id.as_deref().unwrap_or(""),
            user_id = event.user_id.as_deref().unwrap_or(""),
            fields = %event.fields,
            "billing audit"
        );
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.name).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    fn emit(&self, name: &'static str, request_id: Option<&str>, user_id: Option<&str>, fields: Value) {
        self.sink.record(AuditEvent {
            name,
            request_id: request_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
            fields,
        });
    }

    pub fn precheck_start(&self, request_id: &str, user_id: &str, model: &str, estimated_tokens: u64) {
        self.emit(
            "billing_precheck_start",
            Some(request_id),
            Some(user_id),
            json!({ "model": model, "estimated_input_tokens": estimated_tokens }),
        );
    }

    pub fn precheck_result(
        &self,
        request_id: &str,
        user_id: &str,
        allowed: bool,
        reason: Option<&str>,
        estimated_cost_nano: i128,
    ) {
        self.emit(
            "billing_precheck_result",
            Some(request_id),
            Some(user_id),
            json!({
                "allowed": allowed,
                "reason": reason,
                "estimated_cost_nano": estimated_cost_nano.to_string(),
            }),
        );
    }

    pub fn precheck_error(&self, request_id: &str, user_id: &str, error: &str) {
        self.emit(
            "billing_precheck_error",
            Some(request_id),
            Some(user_id),
            json!({ "error": error }),
        );
    }

    pub fn billing_start(&self, request_id: &str, user_id: &str, model: &str, stage: &str) {
        self.emit(
            "billing_start",
            Some(request_id),
            Some(user_id),
            json!({ "model": model, "stage": stage }),
        );
    }

    pub fn billing_result(
        &self,
        request_id: &str,
        user_id: &str,
        charged_nano: i128,
        balance_after: Option<i128>,
        already_billed: bool,
    ) {
        self.emit(
            "billing_result",
            Some(request_id),
            Some(user_id),
            json!({
                "charged_nano": charged_nano.to_string(),
                "balance_after_nano": balance_after.map(|v| v.to_string()),
                "already_billed": already_billed,
            }),
        );
    }

    pub fn billing_error(&self, request_id: &str, user_id: &str, error: &str) {
        self.emit(
            "billing_error",
            Some(request_id),
            Some(user_id),
            json!({ "error": error }),
        );
    }

    pub fn async_completion_start(&self, request_id: &str, success: bool) {
        self.emit(
            "billing_async_completion_start",
            Some(request_id),
            None,
            json!({ "success": success }),
        );
    }

    pub fn async_completion_result(&self, request_id: &str, user_id: &str, outcome: &str) {
        self.emit(
            "billing_async_completion_result",
            Some(request_id),
            Some(user_id),
            json!({ "outcome": outcome }),
        );
    }

    pub fn refund(&self, request_id: &str, user_id: &str, amount_nano: i128, reason: &str) {
        self.emit(
            "billing_refund",
            Some(request_id),
            Some(user_id),
            json!({ "amount_nano": amount_nano.to_string(), "reason": reason }),
        );
    }

    pub fn adjustment(&self, user_id: &str, amount_nano: i128, reason: &str, reference: &str) {
        self.emit(
            "billing_adjustment",
            None,
            Some(user_id),
            json!({
                "amount_nano": amount_nano.to_string(),
                "reason": reason,
                "reference": reference,
            }),
        );
    }

    pub fn consistency_check(&self, check: &str, checked: usize, inconsistent: usize, fixed: usize) {
        self.emit(
            "billing_consistency_check",
            None,
            None,
            json!({
                "check": check,
                "total_checked": checked,
                "inconsistent_count": inconsistent,
                "fixed_count": fixed,
            }),
        );
    }

    pub fn quota_consumption(&self, request_id: &str, quota_id: &str, quota_type: &str, amount: i64) {
        self.emit(
            "quota_consumption",
            Some(request_id),
            None,
            json!({ "quota_id": quota_id, "quota_type": quota_type, "amount": amount }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_event_order() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::new(sink.clone());
        logger.precheck_start("r1", "u1", "gpt-4o", 12);
        logger.precheck_result("r1", "u1", true, None, 12_000);
        assert_eq!(
            sink.names(),
            vec!["billing_precheck_start", "billing_precheck_result"]
        );
        assert_eq!(sink.events()[1].fields["estimated_cost_nano"], "12000");
    }
}
