use crate::app::{AppState, CLIENT_REQUEST_ID_HEADER, REQUEST_ID_HEADER};
use crate::billing::{
    BillingContext, BillingError, BillingErrorKind, BillingManager, PreCheckDecision, RequestType,
};
use crate::error::{AppError, AppResult, GatewayError};
use crate::estimate::{estimate_input_tokens, estimate_tokens};
use crate::providers::ProviderCandidate;
use crate::request::GatewayRequest;
use crate::streaming::{self, StreamOutcome};
use crate::transform::{
    TransformedRequest, Usage, extract_response_text, extract_usage, transform_request,
};
use crate::upstream;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use std::convert::Infallible;
use tokio::sync::mpsc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    proxy(state, headers, body, "/v1/chat/completions", RequestType::Chat).await
}

pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    proxy(state, headers, body, "/v1/messages", RequestType::Messages).await
}

pub async fn create_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    proxy(state, headers, body, "/v1/completions", RequestType::Completion).await
}

/// auth → parse → select → pre-check → transform → execute → commit.
async fn proxy(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    path: &'static str,
    request_type: RequestType,
) -> AppResult<Response> {
    let auth = state.auth.authenticate_headers(&headers).await?;
    let request_id = header_value(&headers, REQUEST_ID_HEADER)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let req = GatewayRequest::parse(request_id, auth.user_id, auth.api_key_id, &body)?;
    let candidate = state.selector.select(&req.model).await?;

    let mut ctx = BillingContext::for_request(&req, request_type, path);
    ctx.set_provider(&candidate);
    let estimated_input = estimate_input_tokens(&req.payload_value());
    let check = state.billing.pre_check(&mut ctx, estimated_input).await?;
    if let PreCheckDecision::Reject { reason } = &check.decision {
        return Err(precheck_rejection(reason));
    }

    let transformed = transform_request(&candidate, path, req.payload.clone());
    let forward_headers = upstream::forwardable_headers(&headers);
    tracing::debug!(
        request_id = %ctx.request_id,
        model = %req.model,
        provider = %candidate.provider.slug,
        stream = req.stream,
        client_request_id = header_value(&headers, CLIENT_REQUEST_ID_HEADER).as_deref(),
        "forwarding request"
    );

    if req.stream {
        return Ok(forward_stream(
            state,
            candidate,
            transformed,
            forward_headers,
            ctx,
            estimated_input,
        )
        .await);
    }
    forward_buffered(&state, &candidate, &transformed, forward_headers, ctx, estimated_input).await
}

async fn forward_buffered(
    state: &AppState,
    candidate: &ProviderCandidate,
    transformed: &TransformedRequest,
    headers: HeaderMap,
    mut ctx: BillingContext,
    estimated_input: u64,
) -> AppResult<Response> {
    let family = candidate.provider.family;
    let result = upstream::forward_buffered(
        &state.http,
        &candidate.provider,
        &transformed.path,
        headers,
        &transformed.body,
        state.runtime.request_timeout_ms,
    )
    .await;

    let resp = match result {
        Ok(resp) => resp,
        Err(err) => {
            record_upstream(candidate, "error");
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = %candidate.provider.slug,
                error = %err.message,
                "upstream call failed"
            );
            let status = err.status.map(|s| s.as_u16()).unwrap_or(502);
            ctx.finish(status, false, Some(err.message.clone()));
            commit_best_effort(&state.billing, &mut ctx).await;
            return Err(GatewayError::from(err).into());
        }
    };
    record_upstream(candidate, "success");

    // a malformed body is still returned; usage then falls back to estimation
    let parsed = resp.json();
    let usage = parsed
        .as_ref()
        .and_then(|value| extract_usage(family, value))
        .unwrap_or_else(|| {
            let text = match &parsed {
                Some(value) => extract_response_text(family, value),
                None => String::from_utf8_lossy(&resp.body).into_owned(),
            };
            Usage::new(estimated_input, estimate_tokens(&text))
        });
    ctx.apply_usage(&usage);
    ctx.finish(resp.status.as_u16(), true, None);
    commit_best_effort(&state.billing, &mut ctx).await;

    let mut builder = Response::builder().status(resp.status);
    if let Some(content_type) = resp.content_type.as_deref() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(resp.body)).map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "response_build_failed",
            err.to_string(),
        )
        .with_type("server_error")
    })
}

async fn forward_stream(
    state: AppState,
    candidate: ProviderCandidate,
    transformed: TransformedRequest,
    headers: HeaderMap,
    mut ctx: BillingContext,
    estimated_input: u64,
) -> Response {
    let opened = upstream::open_stream(
        &state.http,
        &candidate.provider,
        &transformed.path,
        headers,
        &transformed.body,
    )
    .await;
    let resp = match opened {
        Ok(resp) => resp,
        Err(err) => {
            record_upstream(&candidate, "error");
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = %candidate.provider.slug,
                error = %err.message,
                "upstream stream failed to open"
            );
            let status = err.status.map(|s| s.as_u16()).unwrap_or(502);
            ctx.finish(status, false, Some(err.message));
            commit_best_effort(&state.billing, &mut ctx).await;
            let events = futures_util::stream::iter(vec![Ok::<_, Infallible>(
                streaming::error_event(),
            )]);
            return Sse::new(events).into_response();
        }
    };
    record_upstream(&candidate, "success");

    let capacity = state.runtime.stream_queue_capacity;
    let (chunks, errors) = streaming::spawn_producer(resp.bytes_stream(), capacity);
    let (tx, rx) = mpsc::channel::<Event>(capacity.max(1));
    let family = candidate.provider.family;
    let billing = state.billing.clone();
    tokio::spawn(async move {
        let summary = streaming::relay(family, estimated_input, chunks, errors, tx).await;
        ctx.apply_usage(&summary.usage);
        // partial output is billable whatever the outcome
        ctx.finish(200, true, summary.error.clone());
        tracing::info!(
            request_id = %ctx.request_id,
            outcome = summary.outcome.as_str(),
            chunks = summary.chunks,
            usage_observed = summary.usage_observed,
            input_tokens = ctx.input_tokens,
            output_tokens = ctx.output_tokens,
            "stream finished"
        );
        if summary.outcome == StreamOutcome::ClientCancelled {
            tracing::debug!(request_id = %ctx.request_id, "client went away mid-stream");
        }
        commit_best_effort(&billing, &mut ctx).await;
    });

    Sse::new(tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        .into_response()
}

/// Billing failures never fail the caller's request; the consistency
/// checker repairs what is left behind.
pub(crate) async fn commit_best_effort(billing: &BillingManager, ctx: &mut BillingContext) {
    if let Err(err) = billing.commit(ctx).await {
        tracing::error!(
            request_id = %ctx.request_id,
            user_id = %ctx.user_id,
            error = %err.message,
            "billing commit failed"
        );
    }
}

pub(crate) fn precheck_rejection(reason: &str) -> AppError {
    if reason == "insufficient_balance" {
        BillingError::new(BillingErrorKind::InsufficientBalance, "insufficient balance").into()
    } else {
        AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            reason.to_string(),
            format!("request rejected: {reason}"),
        )
        .with_type("quota_error")
    }
}

fn record_upstream(candidate: &ProviderCandidate, outcome: &'static str) {
    metrics::counter!(
        "relaymeter_upstream_requests_total",
        "provider" => candidate.provider.slug.clone(),
        "outcome" => outcome
    )
    .increment(1);
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_payment_and_rate_statuses() {
        let balance = precheck_rejection("insufficient_balance");
        assert_eq!(balance.status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(balance.code, "insufficient_balance");
        assert_eq!(balance.error_type, "billing_error");
        let quota = precheck_rejection("tokens_quota_exceeded");
        assert_eq!(quota.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(quota.code, "tokens_quota_exceeded");
    }
}
