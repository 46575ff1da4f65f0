//! Operator routes. Mounted only when an admin token is configured.

use crate::app::AppState;
use crate::billing::quota::{QuotaPeriod, QuotaType};
use crate::billing::{ConsistencyReport, ModelPricing};
use crate::config::{ProviderHealth, ProviderStatus};
use crate::error::{AppError, AppResult};
use crate::providers::{CreateProviderInput, UpsertModelSupportInput};
use crate::users::{format_nano_to_usd, parse_nano_usd, parse_usd_to_nano};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

fn require_admin(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let expected = state.runtime.admin_token.as_deref().ok_or_else(|| {
        AppError::new(StatusCode::NOT_FOUND, "not_found", "admin routes are disabled")
    })?;
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if provided != Some(expected) {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ));
    }
    Ok(())
}

fn store_error(code: &'static str) -> impl Fn(String) -> AppError {
    move |err| {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, err).with_type("server_error")
    }
}

/// Amounts arrive either as integer nano-USD or as decimal dollars.
fn parse_amount(nano: Option<&str>, usd: Option<&str>) -> AppResult<i128> {
    let (parsed, param) = match (nano, usd) {
        (Some(raw), _) => (parse_nano_usd(raw), "amount_nano_usd"),
        (None, Some(raw)) => (parse_usd_to_nano(raw), "amount_usd"),
        (None, None) => (Err("amount is required".to_string()), "amount_nano_usd"),
    };
    parsed.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_amount", err).with_param(param)
    })
}

#[derive(Debug, Deserialize)]
pub struct ConsistencyQuery {
    pub window_hours: Option<i64>,
    pub auto_fix: Option<bool>,
}

pub async fn run_consistency_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConsistencyQuery>,
) -> AppResult<Json<ConsistencyReport>> {
    require_admin(&state, &headers)?;
    let window_hours = query
        .window_hours
        .unwrap_or(state.runtime.consistency_window_hours);
    let auto_fix = query.auto_fix.unwrap_or(state.runtime.consistency_auto_fix);
    let report = state
        .consistency
        .run_full_consistency_check(window_hours, auto_fix)
        .await;
    Ok(Json(report))
}

pub async fn check_user_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let issue = state
        .consistency
        .check_user_balance_consistency(&user_id)
        .await?;
    let balance = state
        .user_store
        .get_user_balance(&user_id)
        .await
        .map_err(store_error("balance_lookup_failed"))?;
    Ok(Json(json!({
        "user_id": user_id,
        "balance_usd": balance.map(|b| format_nano_to_usd(b.balance_nano_usd)),
        "consistent": issue.is_none(),
        "issue": issue,
    })))
}

pub async fn retry_missed_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(usage_log_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let task = state
        .compensation
        .retry_missed_charge(&usage_log_id)
        .await?;
    Ok(Json(json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub request_id: String,
    pub amount_nano_usd: Option<String>,
    pub amount_usd: Option<String>,
    #[serde(default)]
    pub reason: String,
}

pub async fn refund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefundBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let amount = parse_amount(body.amount_nano_usd.as_deref(), body.amount_usd.as_deref())?;
    let task = state
        .compensation
        .refund(&body.request_id, amount, &body.reason)
        .await?;
    Ok(Json(json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
pub struct AdjustBody {
    pub user_id: String,
    pub amount_nano_usd: Option<String>,
    pub amount_usd: Option<String>,
    #[serde(default)]
    pub reason: String,
    pub reference: String,
}

pub async fn adjust_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AdjustBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let amount = parse_amount(body.amount_nano_usd.as_deref(), body.amount_usd.as_deref())?;
    let task = state
        .compensation
        .adjust_balance(&body.user_id, amount, &body.reason, &body.reference)
        .await?;
    Ok(Json(json!({ "task": task })))
}

pub async fn list_compensation_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let tasks = state.compensation.tasks_for_user(&user_id).await?;
    Ok(Json(json!({ "data": tasks })))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub username: String,
    #[serde(default)]
    pub balance_unlimited: bool,
}

pub async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let user = state
        .user_store
        .create_user(&body.username)
        .await
        .map_err(store_error("user_create_failed"))?;
    if body.balance_unlimited {
        state
            .user_store
            .set_balance_unlimited(&user.id, true)
            .await
            .map_err(store_error("user_update_failed"))?;
    }
    Ok(Json(json!({ "id": user.id, "username": user.username })))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    #[serde(default)]
    pub name: String,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<CreateApiKeyBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let (api_key, secret) = state
        .user_store
        .create_api_key(&user_id, &body.name)
        .await
        .map_err(store_error("api_key_create_failed"))?;
    Ok(Json(json!({ "api_key": api_key, "key": secret })))
}

#[derive(Debug, Deserialize)]
pub struct TopupBody {
    pub amount_nano_usd: Option<String>,
    pub amount_usd: Option<String>,
    #[serde(default)]
    pub description: String,
}

pub async fn topup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<TopupBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let amount = parse_amount(body.amount_nano_usd.as_deref(), body.amount_usd.as_deref())?;
    let record = state
        .billing
        .ledger()
        .credit_balance(&user_id, amount, &body.description)
        .await?;
    let balance_usd = record.balance_after_nano_usd.map(format_nano_to_usd);
    Ok(Json(json!({ "record": record, "balance_usd": balance_usd })))
}

pub async fn create_provider(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateProviderInput>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let provider = state
        .provider_store
        .create_provider(body)
        .await
        .map_err(store_error("provider_create_failed"))?;
    Ok(Json(json!({ "provider": provider })))
}

#[derive(Debug, Deserialize)]
pub struct ProviderStateBody {
    pub health: Option<ProviderHealth>,
    pub status: Option<ProviderStatus>,
}

pub async fn set_provider_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(provider_id): Path<String>,
    Json(body): Json<ProviderStateBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    if let Some(health) = body.health {
        state
            .provider_store
            .set_provider_health(&provider_id, health)
            .await
            .map_err(store_error("provider_update_failed"))?;
    }
    if let Some(status) = body.status {
        state
            .provider_store
            .set_provider_status(&provider_id, status)
            .await
            .map_err(store_error("provider_update_failed"))?;
    }
    let provider = state
        .provider_store
        .get_provider(&provider_id)
        .await
        .map_err(store_error("provider_lookup_failed"))?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "provider not found"))?;
    Ok(Json(json!({ "provider": provider })))
}

pub async fn upsert_model_support(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpsertModelSupportInput>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let support = state
        .provider_store
        .upsert_model_support(body)
        .await
        .map_err(store_error("model_support_upsert_failed"))?;
    Ok(Json(json!({ "model_support": support })))
}

pub async fn upsert_pricing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ModelPricing>,
) -> AppResult<Json<ModelPricing>> {
    require_admin(&state, &headers)?;
    state
        .pricing_store
        .upsert_pricing(&body)
        .await
        .map_err(store_error("pricing_upsert_failed"))?;
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct CreateQuotaBody {
    pub api_key_id: String,
    pub quota_type: String,
    #[serde(default)]
    pub period: Option<String>,
    pub limit_value: i64,
}

pub async fn create_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateQuotaBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let quota_type = QuotaType::from_str(&body.quota_type).ok_or_else(|| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_quota_type", "unknown quota type")
            .with_param("quota_type")
    })?;
    let period = match body.period.as_deref() {
        Some(raw) => QuotaPeriod::from_str(raw).ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "invalid_quota_period", "unknown period")
                .with_param("period")
        })?,
        None => QuotaPeriod::None,
    };
    let quota = state
        .quota_store
        .create_quota(&body.api_key_id, quota_type, period, body.limit_value)
        .await
        .map_err(store_error("quota_create_failed"))?;
    Ok(Json(json!({ "quota": quota })))
}
