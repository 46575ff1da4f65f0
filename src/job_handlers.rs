use crate::app::AppState;
use crate::billing::{BillingContext, PreCheckDecision, RequestType};
use crate::error::{AppError, AppResult, GatewayError};
use crate::handlers::precheck_rejection;
use crate::jobs::JobEngine;
use crate::jobs::model::{FetchView, JobAction, MjResponse, SubmitBody};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

const CALLBACK_SECRET_HEADER: &str = "mj-api-secret";

pub async fn submit_job(
    State(state): State<AppState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<MjResponse>> {
    let auth = state.auth.authenticate_headers(&headers).await?;
    let action = JobAction::from_route(&action).ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "unknown_action",
            format!("unknown submit action {action}"),
        )
    })?;
    let body: SubmitBody = serde_json::from_slice(&body).map_err(|err| {
        GatewayError::validation("invalid_request", format!("invalid JSON body: {err}"))
    })?;
    let submission = body.validate(action)?;

    let job_id = JobEngine::new_job_id();
    let mut ctx = BillingContext::new(
        job_id,
        auth.user_id,
        auth.api_key_id,
        state.jobs.model(),
        RequestType::Midjourney,
        action.submit_path(),
    );
    let check = state.billing.pre_check(&mut ctx, 0).await?;
    if let PreCheckDecision::Reject { reason } = &check.decision {
        return Err(precheck_rejection(reason));
    }

    let job = state.jobs.submit(ctx, submission).await?;
    Ok(Json(MjResponse::submitted(&job)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    pub task_id: String,
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CancelBody>,
) -> AppResult<Json<MjResponse>> {
    let auth = state.auth.authenticate_headers(&headers).await?;
    let job = state.jobs.cancel(&auth.user_id, &body.task_id).await?;
    Ok(Json(MjResponse {
        code: 1,
        description: "cancelled".to_string(),
        properties: json!({ "status": job.status.as_str(), "action": job.action.as_str() }),
        result: Value::String(job.job_id),
    }))
}

pub async fn fetch_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<FetchView>> {
    let auth = state.auth.authenticate_headers(&headers).await?;
    let job = state
        .jobs
        .get(&job_id)
        .await?
        .ok_or(GatewayError::JobNotFound(job_id))?;
    if job.user_id != auth.user_id {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "job belongs to another user",
        ));
    }
    Ok(Json(FetchView::from(&job)))
}

/// Upstream completion notifications, authenticated with the provider's own
/// `mj-api-secret`. Unknown task ids are acknowledged and ignored so the
/// upstream stops redelivering them.
pub async fn job_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    let secret = headers
        .get(CALLBACK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    let job = state.jobs.handle_callback(&payload, secret).await?;
    let description = if job.is_some() { "accepted" } else { "ignored" };
    Ok(Json(json!({ "code": 1, "description": description })))
}
