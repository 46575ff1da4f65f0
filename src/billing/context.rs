use crate::providers::ProviderCandidate;
use crate::request::GatewayRequest;
use crate::transform::Usage;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Chat,
    Completion,
    Messages,
    Midjourney,
}

impl RequestType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "completion" => Some(Self::Completion),
            "messages" => Some(Self::Messages),
            "midjourney" => Some(Self::Midjourney),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Completion => "completion",
            Self::Messages => "messages",
            Self::Midjourney => "midjourney",
        }
    }

    /// Billed per request rather than per token.
    pub fn is_fixed_price(&self) -> bool {
        matches!(self, Self::Midjourney)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStage {
    PreCheck,
    Pending,
    Processed,
    Error,
    Refunded,
    LogOnly,
}

impl BillingStage {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pre_check" => Some(Self::PreCheck),
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            "refunded" => Some(Self::Refunded),
            "log_only" => Some(Self::LogOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCheck => "pre_check",
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::Refunded => "refunded",
            Self::LogOnly => "log_only",
        }
    }
}

/// Typed handoff between the proxy path and billing. Authentication fills
/// the identity fields, the executor fills provider and usage fields.
#[derive(Debug, Clone, Serialize)]
pub struct BillingContext {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model_slug: String,
    pub provider_id: Option<String>,
    pub provider_name: Option<String>,
    pub request_time: DateTime<Utc>,
    pub method: String,
    pub endpoint: String,
    pub request_type: RequestType,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_used: Option<f64>,
    pub estimated_cost_nano: Option<i128>,
    pub actual_cost_nano: Option<i128>,
    pub status_code: u16,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub stage: BillingStage,
    pub is_billed: bool,
}

impl BillingContext {
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        api_key_id: impl Into<String>,
        model_slug: impl Into<String>,
        request_type: RequestType,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            api_key_id: api_key_id.into(),
            model_slug: model_slug.into(),
            provider_id: None,
            provider_name: None,
            request_time: Utc::now(),
            method: "POST".to_string(),
            endpoint: endpoint.into(),
            request_type,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost_used: None,
            estimated_cost_nano: None,
            actual_cost_nano: None,
            status_code: 0,
            duration_ms: 0,
            success: false,
            error_message: None,
            stage: BillingStage::PreCheck,
            is_billed: false,
        }
    }

    pub fn for_request(req: &GatewayRequest, request_type: RequestType, endpoint: &str) -> Self {
        Self::new(
            req.request_id.clone(),
            req.user_id.clone(),
            req.api_key_id.clone(),
            req.model.clone(),
            request_type,
            endpoint,
        )
    }

    pub fn set_provider(&mut self, candidate: &ProviderCandidate) {
        self.provider_id = Some(candidate.provider.id.clone());
        self.provider_name = Some(candidate.provider.slug.clone());
    }

    /// Applies usage monotonically: a field is only overwritten by an equal
    /// or larger value.
    pub fn apply_usage(&mut self, usage: &Usage) {
        self.input_tokens = self.input_tokens.max(usage.input_tokens);
        self.output_tokens = self.output_tokens.max(usage.output_tokens);
        self.total_tokens = self
            .total_tokens
            .max(usage.total_tokens)
            .max(self.input_tokens.saturating_add(self.output_tokens));
        if usage.cost_used.is_some() {
            self.cost_used = usage.cost_used;
        }
    }

    pub fn finish(&mut self, status_code: u16, success: bool, error_message: Option<String>) {
        self.status_code = status_code;
        self.success = success;
        self.error_message = error_message;
        self.duration_ms = (Utc::now() - self.request_time).num_milliseconds().max(0) as u64;
    }

    /// Async jobs never bill here; they settle through
    /// `BillingManager::process_async_completion`.
    pub fn should_bill(&self) -> bool {
        if self.is_billed || !self.success || !(200..300).contains(&self.status_code) {
            return false;
        }
        !matches!(self.request_type, RequestType::Midjourney)
    }

    pub fn to_usage_log(&self) -> NewUsageLog {
        NewUsageLog {
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
            api_key_id: self.api_key_id.clone(),
            model: self.model_slug.clone(),
            provider_id: self.provider_id.clone(),
            provider_name: self.provider_name.clone(),
            request_type: self.request_type,
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            cost_used: self.cost_used,
            estimated_cost_nano: self.estimated_cost_nano,
            status_code: self.status_code,
            success: self.success,
            duration_ms: self.duration_ms,
            error_message: self.error_message.clone(),
            stage: self.stage,
        }
    }
}

/// Row written to `usage_logs`.
#[derive(Debug, Clone)]
pub struct NewUsageLog {
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
    pub status_code: u16,
    pub success: bool,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub stage: BillingStage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(request_type: RequestType) -> BillingContext {
        BillingContext::new("r", "u", "k", "m", request_type, "/v1/chat/completions")
    }

    #[test]
    fn usage_never_regresses() {
        let mut c = ctx(RequestType::Chat);
        c.apply_usage(&Usage::new(10, 20));
        c.apply_usage(&Usage::new(4, 25));
        assert_eq!((c.input_tokens, c.output_tokens, c.total_tokens), (10, 25, 35));
    }

    #[test]
    fn only_successful_outcomes_bill() {
        let mut c = ctx(RequestType::Chat);
        c.finish(200, true, None);
        assert!(c.should_bill());
        c.finish(502, false, Some("bad gateway".to_string()));
        assert!(!c.should_bill());
        c.finish(200, true, None);
        c.is_billed = true;
        assert!(!c.should_bill());
    }

    #[test]
    fn async_jobs_never_bill_at_submission() {
        let mut c = ctx(RequestType::Midjourney);
        c.finish(200, true, None);
        assert!(!c.should_bill());
    }
}
