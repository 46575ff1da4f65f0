use axum::Json;
use axum::body::Body;
use axum::extract::Path;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Sse};
use axum::routing::{get, post};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use relaymeter::billing::{BillingStage, ModelPricing, QuotaPeriod, QuotaType, RecordType};
use relaymeter::config::{ProviderFamily, ProviderHealth};
use relaymeter::providers::{CreateProviderInput, UpsertModelSupportInput};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-secret";

struct TestContext {
    router: axum::Router,
    auth_header: String,
    api_key_id: String,
    user_id: String,
    state: relaymeter::app::AppState,
    captured_headers: Arc<Mutex<Vec<(String, String)>>>,
    _temp_dir: TempDir,
}

type Captured = Arc<Mutex<Vec<(String, String)>>>;

fn capture(captured: &Captured, headers: &HeaderMap, names: &[&str]) {
    if let Ok(mut lock) = captured.lock() {
        for name in names {
            if let Some(v) = headers.get(*name).and_then(|h| h.to_str().ok()) {
                lock.push((name.to_string(), v.to_string()));
            }
        }
    }
}

fn forced_error(body: &Value) -> Option<axum::response::Response> {
    let status = body.get("force_status").and_then(|v| v.as_u64())?;
    let status = StatusCode::from_u16(u16::try_from(status).ok()?).ok()?;
    Some(
        (
            status,
            Json(json!({ "error": { "code": "forced", "message": "provider internals" } })),
        )
            .into_response(),
    )
}

/// Mock upstream. The first path segment tags which configured provider
/// served the call.
async fn start_upstream() -> (SocketAddr, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));

    let chat_captured = captured.clone();
    let chat = move |Path(tag): Path<String>, headers: HeaderMap, Json(body): Json<Value>| {
        let captured = chat_captured.clone();
        async move {
            capture(&captured, &headers, &["authorization", "x-request-id", "x-client-request-id"]);
            if let Some(resp) = forced_error(&body) {
                return resp;
            }
            if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
                if body.get("hang_after_first").and_then(|v| v.as_bool()) == Some(true) {
                    let first = futures_util::stream::iter(vec![Ok::<_, Infallible>(
                        Event::default().data(
                            json!({
                                "choices": [{"delta": {"content": "partial"}}],
                                "usage": {"prompt_tokens": 10, "completion_tokens": 5}
                            })
                            .to_string(),
                        ),
                    )]);
                    return Sse::new(first.chain(futures_util::stream::pending())).into_response();
                }
                if body.get("omit_usage").and_then(|v| v.as_bool()) == Some(true) {
                    let events = vec![
                        Ok::<_, Infallible>(Event::default().data(
                            json!({"choices": [{"delta": {"content": "hello world"}}]}).to_string(),
                        )),
                        Ok(Event::default().data("[DONE]")),
                    ];
                    return Sse::new(futures_util::stream::iter(events)).into_response();
                }
                let events: Vec<Result<Event, Infallible>> = [5, 12, 20]
                    .iter()
                    .map(|output| {
                        Ok(Event::default().data(
                            json!({
                                "choices": [{"delta": {"content": "x"}}],
                                "usage": {"prompt_tokens": 10, "completion_tokens": output}
                            })
                            .to_string(),
                        ))
                    })
                    .chain(std::iter::once(Ok(Event::default().data("[DONE]"))))
                    .collect();
                return Sse::new(futures_util::stream::iter(events)).into_response();
            }
            if body.get("malformed").and_then(|v| v.as_bool()) == Some(true) {
                return (StatusCode::OK, "not json at all").into_response();
            }
            Json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": body.get("model").cloned().unwrap_or(Value::Null),
                "served_by": tag,
                "max_completion_tokens": body.get("max_completion_tokens").cloned().unwrap_or(Value::Null),
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
            }))
            .into_response()
        }
    };

    let messages_captured = captured.clone();
    let messages = move |headers: HeaderMap, Json(body): Json<Value>| {
        let captured = messages_captured.clone();
        async move {
            capture(&captured, &headers, &["x-api-key", "anthropic-version"]);
            Json(json!({
                "type": "message",
                "model": body.get("model").cloned().unwrap_or(Value::Null),
                "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 30, "output_tokens": 5}
            }))
        }
    };

    let mj_captured = captured.clone();
    let mj_submit = move |Path((_tag, action)): Path<(String, String)>, headers: HeaderMap, Json(body): Json<Value>| {
        let captured = mj_captured.clone();
        async move {
            capture(&captured, &headers, &["mj-api-secret"]);
            if let Ok(mut lock) = captured.lock() {
                lock.push((format!("mj-submit-{action}"), body.to_string()));
            }
            let task = match action.as_str() {
                "action" => "up-task-2",
                _ => "up-task-1",
            };
            Json(json!({ "code": 1, "description": "ok", "result": task }))
        }
    };

    let mj_fetch = |Path((_tag, task)): Path<(String, String)>| async move {
        Json(json!({
            "id": task,
            "status": "SUCCESS",
            "progress": "100%",
            "imageUrl": format!("https://img.local/{task}.png"),
            "buttons": [
                { "customId": format!("MJ::JOB::upsample::1::{task}::SOLO"), "label": "U1" }
            ]
        }))
    };

    let app = axum::Router::new()
        .route("/{tag}/v1/chat/completions", post(chat))
        .route("/{tag}/v1/messages", post(messages))
        .route("/{tag}/mj/submit/{action}", post(mj_submit))
        .route("/{tag}/mj/task/{task}/fetch", get(mj_fetch));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, captured)
}

async fn create_provider(
    state: &relaymeter::app::AppState,
    slug: &str,
    family: ProviderFamily,
    base_url: &str,
    model: &str,
    priority: i64,
) -> String {
    let provider = state
        .provider_store
        .create_provider(CreateProviderInput {
            slug: slug.to_string(),
            name: slug.to_string(),
            family: Some(family),
            base_url: Some(base_url.to_string()),
            credential: Some(format!("{slug}-key")),
            priority,
        })
        .await
        .unwrap();
    state
        .provider_store
        .upsert_model_support(UpsertModelSupportInput {
            provider_id: provider.id.clone(),
            model_slug: model.to_string(),
            upstream_alias: None,
            config: Default::default(),
            priority: 0,
            enabled: true,
        })
        .await
        .unwrap();
    provider.id
}

async fn setup() -> TestContext {
    let (upstream_addr, captured_headers) = start_upstream().await;
    let base = format!("http://{upstream_addr}");

    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("relaymeter.db");
    let state = relaymeter::app::load_state_with_runtime(relaymeter::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        consistency_interval_secs: 0,
        job_workers: 0,
        admin_token: Some(ADMIN_TOKEN.to_string()),
        compensation_retry_interval_ms: 1,
        ..relaymeter::app::RuntimeConfig::default()
    })
    .await
    .expect("load state");

    let user = state.user_store.create_user("tenant-1").await.unwrap();
    state
        .billing
        .ledger()
        .credit_balance(&user.id, 1_000_000_000, "initial credit")
        .await
        .unwrap();
    let (api_key, token) = state
        .user_store
        .create_api_key(&user.id, "test-key")
        .await
        .unwrap();

    let primary = create_provider(
        &state,
        "primary",
        ProviderFamily::OpenAi,
        &format!("{base}/primary"),
        "gpt-4o",
        0,
    )
    .await;
    state
        .provider_store
        .set_provider_health(&primary, ProviderHealth::Unhealthy)
        .await
        .unwrap();
    create_provider(
        &state,
        "secondary",
        ProviderFamily::OpenAi,
        &format!("{base}/secondary"),
        "gpt-4o",
        1,
    )
    .await;
    create_provider(
        &state,
        "claude-direct",
        ProviderFamily::Anthropic,
        &format!("{base}/claude"),
        "claude-3",
        0,
    )
    .await;
    create_provider(
        &state,
        "mj-relay",
        ProviderFamily::Midjourney,
        &format!("{base}/mj"),
        "midjourney",
        0,
    )
    .await;

    for pricing in [
        ModelPricing::per_token("gpt-4o", 1_000_000, 2_000_000),
        ModelPricing::per_token("claude-3", 3_000_000, 15_000_000),
        ModelPricing::per_request("midjourney", 50_000_000),
    ] {
        state.pricing_store.upsert_pricing(&pricing).await.unwrap();
    }

    TestContext {
        router: relaymeter::app::build_app(state.clone()),
        auth_header: format!("Bearer {token}"),
        api_key_id: api_key.id,
        user_id: user.id,
        state,
        captured_headers,
        _temp_dir: temp_dir,
    }
}

async fn send(ctx: &TestContext, req: Request<Body>) -> (StatusCode, String) {
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

/// Posts with a caller-chosen `x-request-id` and returns the id the gateway
/// minted for the call alongside the response.
async fn json_post_with_id(
    ctx: &TestContext,
    path: &str,
    client_request_id: &str,
    body: Value,
) -> (StatusCode, String, String) {
    json_post_as(ctx, &ctx.auth_header, path, client_request_id, body).await
}

async fn json_post_as(
    ctx: &TestContext,
    auth_header: &str,
    path: &str,
    client_request_id: &str,
    body: Value,
) -> (StatusCode, String, String) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, auth_header)
        .header("x-request-id", client_request_id)
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let request_id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string(), request_id)
}

async fn json_post(ctx: &TestContext, path: &str, body: Value) -> (StatusCode, String) {
    let (status, body, _) =
        json_post_with_id(ctx, path, &uuid::Uuid::new_v4().to_string(), body).await;
    (status, body)
}

async fn get_json(ctx: &TestContext, path: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::empty())
        .unwrap();
    send(ctx, req).await
}

async fn wait_for_billed_log(ctx: &TestContext, request_id: &str) -> relaymeter::billing::UsageLog {
    for _ in 0..100 {
        if let Some(log) = ctx
            .state
            .billing
            .ledger()
            .get_usage_log_by_request_id(request_id)
            .await
            .unwrap()
        {
            if log.is_billed {
                return log;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("usage log for {request_id} was never billed");
}

async fn balance(ctx: &TestContext) -> i128 {
    ctx.state
        .user_store
        .get_user_balance(&ctx.user_id)
        .await
        .unwrap()
        .unwrap()
        .balance_nano_usd
}

#[tokio::test]
async fn auth_required_for_forwarding_endpoints() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o", "messages": []}).to_string(),
        ))
        .unwrap();
    let (status, _) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn buffered_chat_falls_through_unhealthy_provider_and_bills_once() {
    let ctx = setup().await;
    let (status, body, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-e2e-1",
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "ping"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["served_by"], "secondary");
    assert_eq!(value["choices"][0]["message"]["content"], "pong");

    let ledger = ctx.state.billing.ledger();
    let log = ledger
        .get_usage_log_by_request_id(&request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.provider_name.as_deref(), Some("secondary"));
    assert_eq!((log.input_tokens, log.output_tokens), (12, 8));
    assert!(log.is_billed);
    assert_eq!(log.stage, BillingStage::Processed);

    let records = ledger.list_records_for_request(&request_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type, RecordType::Usage);
    // 12/1000 * 1_000_000 + 8/1000 * 2_000_000
    assert_eq!(records[0].amount_nano_usd, -28_000);
    assert_eq!(balance(&ctx).await, 1_000_000_000 - 28_000);
}

#[tokio::test]
async fn caller_credentials_are_replaced_and_request_id_forwarded() {
    let ctx = setup().await;
    let (status, _, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-headers",
        json!({"model": "gpt-4o", "prompt": "hello"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(request_id, "req-headers");
    let captured = ctx.captured_headers.lock().unwrap().clone();
    assert!(captured.contains(&("authorization".to_string(), "Bearer secondary-key".to_string())));
    assert!(captured.contains(&("x-request-id".to_string(), request_id)));
    assert!(captured.contains(&("x-client-request-id".to_string(), "req-headers".to_string())));
}

#[tokio::test]
async fn reused_client_request_id_is_billed_per_call() {
    let ctx = setup().await;
    let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "ping"}]});
    let (_, _, first) = json_post_with_id(&ctx, "/v1/chat/completions", "dup-id", body.clone()).await;
    let (_, _, second) = json_post_with_id(&ctx, "/v1/chat/completions", "dup-id", body.clone()).await;
    assert_ne!(first, second);
    wait_for_billed_log(&ctx, &first).await;
    wait_for_billed_log(&ctx, &second).await;
    assert_eq!(balance(&ctx).await, 1_000_000_000 - 2 * 28_000);

    // another tenant sending the same id gets its own log and charge
    let other = ctx.state.user_store.create_user("tenant-2").await.unwrap();
    ctx.state
        .billing
        .ledger()
        .credit_balance(&other.id, 1_000_000_000, "initial credit")
        .await
        .unwrap();
    let (_, token) = ctx.state.user_store.create_api_key(&other.id, "k").await.unwrap();
    let (status, _, third) = json_post_as(
        &ctx,
        &format!("Bearer {token}"),
        "/v1/chat/completions",
        "dup-id",
        body,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let log = wait_for_billed_log(&ctx, &third).await;
    assert_eq!(log.user_id, other.id);
    let records = ctx.state.billing.ledger().list_records_for_user(&other.id).await.unwrap();
    assert!(records.iter().any(|r| r.amount_nano_usd == -28_000));
    assert_eq!(balance(&ctx).await, 1_000_000_000 - 2 * 28_000);
}

#[tokio::test]
async fn anthropic_family_routes_to_messages_with_its_auth() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({"model": "claude-3", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"type\":\"message\""));
    let captured = ctx.captured_headers.lock().unwrap().clone();
    assert!(captured.contains(&("x-api-key".to_string(), "claude-direct-key".to_string())));
    assert!(captured.contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
}

#[tokio::test]
async fn validation_errors_are_400() {
    let ctx = setup().await;
    let (status, body) = json_post(&ctx, "/v1/chat/completions", json!({"messages": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("MISSING_MODEL"));

    let (status, body) = json_post(&ctx, "/v1/chat/completions", json!({"model": "gpt-4o"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("MISSING_INPUT"));
}

#[tokio::test]
async fn unknown_model_and_outage_are_distinguished() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({"model": "nope", "prompt": "x"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("model_not_found"));

    let providers = ctx.state.provider_store.list_providers().await.unwrap();
    let secondary = providers.iter().find(|p| p.slug == "secondary").unwrap();
    ctx.state
        .provider_store
        .set_provider_health(&secondary.id, ProviderHealth::Unhealthy)
        .await
        .unwrap();
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({"model": "gpt-4o", "prompt": "x"}),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("no_available_provider"));
}

#[tokio::test]
async fn upstream_error_is_generic_logged_and_not_billed() {
    let ctx = setup().await;
    let (status, body, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-upstream-500",
        json!({"model": "gpt-4o", "prompt": "x", "force_status": 502}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.contains("provider internals"));

    let ledger = ctx.state.billing.ledger();
    let log = ledger
        .get_usage_log_by_request_id(&request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!log.success);
    assert_eq!(log.stage, BillingStage::LogOnly);
    assert!(ledger.list_records_for_request(&request_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_upstream_body_is_returned_and_estimated() {
    let ctx = setup().await;
    let (status, body, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-malformed",
        json!({"model": "gpt-4o", "prompt": "abcdefgh", "malformed": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "not json at all");
    let log = wait_for_billed_log(&ctx, &request_id).await;
    assert_eq!(log.input_tokens, relaymeter::estimate::estimate_tokens("abcdefgh"));
}

#[tokio::test]
async fn streaming_relays_events_and_bills_cumulative_usage() {
    let ctx = setup().await;
    let (status, body, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-stream-1",
        json!({"model": "gpt-4o", "stream": true, "messages": [{"role": "user", "content": "go"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.matches("data: ").count(), 4);
    assert!(body.contains("[DONE]"));

    let log = wait_for_billed_log(&ctx, &request_id).await;
    assert_eq!((log.input_tokens, log.output_tokens), (10, 20));
    let records = ctx
        .state
        .billing
        .ledger()
        .list_records_for_request(&request_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    // 10/1000 * 1_000_000 + 20/1000 * 2_000_000
    assert_eq!(records[0].amount_nano_usd, -50_000);
}

#[tokio::test]
async fn client_cancelled_stream_bills_partial_usage() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(
            json!({"model": "gpt-4o", "stream": true, "hang_after_first": true, "prompt": "go"})
                .to_string(),
        ))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let request_id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let mut body = resp.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let first = String::from_utf8_lossy(frame.data_ref().unwrap()).to_string();
    assert!(first.contains("partial"));
    drop(body);

    let log = wait_for_billed_log(&ctx, &request_id).await;
    assert_eq!((log.input_tokens, log.output_tokens), (10, 5));
    let records = ctx
        .state
        .billing
        .ledger()
        .list_records_for_request(&request_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    // 10/1000 * 1_000_000 + 5/1000 * 2_000_000
    assert_eq!(records[0].amount_nano_usd, -20_000);
}

#[tokio::test]
async fn streaming_without_usage_is_estimated() {
    let ctx = setup().await;
    let (status, _, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-stream-est",
        json!({"model": "gpt-4o", "stream": true, "omit_usage": true, "prompt": "count these words"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let log = wait_for_billed_log(&ctx, &request_id).await;
    assert_eq!(
        log.output_tokens,
        relaymeter::estimate::estimate_tokens("hello world")
    );
    assert_eq!(
        log.input_tokens,
        relaymeter::estimate::estimate_tokens("count these words")
    );
}

#[tokio::test]
async fn streaming_open_failure_emits_one_error_event() {
    let ctx = setup().await;
    let (status, body, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-stream-fail",
        json!({"model": "gpt-4o", "stream": true, "prompt": "x", "force_status": 500}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.matches("event: error").count(), 1);
    assert!(!body.contains("provider internals"));
    let log = ctx
        .state
        .billing
        .ledger()
        .get_usage_log_by_request_id(&request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!log.is_billed);
    assert_eq!(log.stage, BillingStage::LogOnly);
}

#[tokio::test]
async fn pre_check_rejects_quota_and_balance() {
    let ctx = setup().await;
    ctx.state
        .quota_store
        .create_quota(&ctx.api_key_id, QuotaType::Requests, QuotaPeriod::Daily, 1)
        .await
        .unwrap();
    let (status, _) = json_post(&ctx, "/v1/chat/completions", json!({"model": "gpt-4o", "prompt": "a"})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = json_post(&ctx, "/v1/chat/completions", json!({"model": "gpt-4o", "prompt": "a"})).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body.contains("requests_quota_exceeded"));

    let poor = ctx.state.user_store.create_user("poor").await.unwrap();
    let (_, token) = ctx.state.user_store.create_api_key(&poor.id, "k").await.unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(
            json!({"model": "gpt-4o", "prompt": "a long enough prompt to cost something"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(body.contains("insufficient_balance"));
}

#[tokio::test]
async fn missing_pricing_is_a_configuration_error() {
    let ctx = setup().await;
    create_provider(
        &ctx.state,
        "unpriced",
        ProviderFamily::OpenAi,
        "http://127.0.0.1:9",
        "free-model",
        0,
    )
    .await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({"model": "free-model", "prompt": "x"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("pricing_not_found"));
}

#[tokio::test]
async fn imagine_job_is_billed_once_on_completion() {
    let ctx = setup().await;
    let (status, body) = json_post(&ctx, "/mj/submit/imagine", json!({"prompt": "a red fox"})).await;
    assert_eq!(status, StatusCode::OK);
    let submitted: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(submitted["code"], 1);
    assert_eq!(submitted["properties"]["status"], "pending_queue");
    let job_id = submitted["result"].as_str().unwrap().to_string();

    let ledger = ctx.state.billing.ledger();
    assert!(ledger.list_records_for_request(&job_id).await.unwrap().is_empty());
    let log = ledger.get_usage_log_by_request_id(&job_id).await.unwrap().unwrap();
    assert_eq!(log.stage, BillingStage::Pending);

    ctx.state.jobs.process_job(&job_id).await;
    let (_, body) = get_json(&ctx, &format!("/mj/task/{job_id}/fetch")).await;
    let view: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["status"], "on_queue");
    assert!(ledger.list_records_for_request(&job_id).await.unwrap().is_empty());

    ctx.state.jobs.poll_once().await;
    let (_, body) = get_json(&ctx, &format!("/mj/task/{job_id}/fetch")).await;
    let view: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["status"], "success");
    assert_eq!(view["progress"], "100%");
    assert_eq!(view["imageUrl"], "https://img.local/up-task-1.png");
    assert_eq!(view["buttons"].as_array().unwrap().len(), 8);
    assert_eq!(
        view["buttons"][0]["customId"],
        format!("MJ::JOB::upsample::1::{job_id}")
    );

    let records = ledger.list_records_for_request(&job_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount_nano_usd, -50_000_000);

    // redelivered completion
    let (status, _) = callback(&ctx, Some("mj-relay-key"), json!({"id": "up-task-1", "status": "SUCCESS"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ledger.list_records_for_request(&job_id).await.unwrap().len(), 1);

    let (status, body) = json_post(&ctx, "/mj/submit/cancel", json!({"taskId": job_id})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("job_already_terminal"));
}

async fn callback(ctx: &TestContext, secret: Option<&str>, body: Value) -> (StatusCode, String) {
    let mut req = Request::builder()
        .method("POST")
        .uri("/mj/callback")
        .header(CONTENT_TYPE, "application/json");
    if let Some(secret) = secret {
        req = req.header("mj-api-secret", secret);
    }
    send(ctx, req.body(Body::from(body.to_string())).unwrap()).await
}

#[tokio::test]
async fn callback_without_provider_secret_is_rejected() {
    let ctx = setup().await;
    let (_, body) = json_post(&ctx, "/mj/submit/imagine", json!({"prompt": "a red fox"})).await;
    let job_id = serde_json::from_str::<Value>(&body).unwrap()["result"]
        .as_str()
        .unwrap()
        .to_string();
    ctx.state.jobs.process_job(&job_id).await;

    let forged = json!({"id": "up-task-1", "status": "SUCCESS", "imageUrl": "https://evil.local/x.png"});
    let (status, body) = callback(&ctx, None, forged.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("invalid_callback_secret"));
    let (status, _) = callback(&ctx, Some("guessed"), forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = get_json(&ctx, &format!("/mj/task/{job_id}/fetch")).await;
    let view: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["status"], "on_queue");
    assert!(ctx.state.billing.ledger().list_records_for_request(&job_id).await.unwrap().is_empty());

    let (status, body) = callback(
        &ctx,
        Some("mj-relay-key"),
        json!({"id": "up-task-1", "status": "FAILURE", "failReason": "banned prompt"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("accepted"));
    let (_, body) = get_json(&ctx, &format!("/mj/task/{job_id}/fetch")).await;
    let view: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["status"], "failed");
}

#[tokio::test]
async fn finished_job_with_lost_settlement_is_repaired() {
    let ctx = setup().await;
    let ledger = ctx.state.billing.ledger();
    let mut job_ids = Vec::new();
    for prompt in ["a red fox", "a blue fox"] {
        let (_, body) = json_post(&ctx, "/mj/submit/imagine", json!({"prompt": prompt})).await;
        let job_id = serde_json::from_str::<Value>(&body).unwrap()["result"]
            .as_str()
            .unwrap()
            .to_string();
        ctx.state.jobs.process_job(&job_id).await;
        job_ids.push(job_id);
    }
    let (succeeded, failed) = (&job_ids[0], &job_ids[1]);
    // both finish in storage but billing never hears about it
    assert!(
        ctx.state
            .job_store
            .complete_success(succeeded, Some("https://img.local/a.png"), &json!([]))
            .await
            .unwrap()
    );
    assert!(ctx.state.job_store.complete_failure(failed, "banned prompt").await.unwrap());
    assert!(ledger.list_records_for_request(succeeded).await.unwrap().is_empty());

    let report = ctx.state.consistency.run_full_consistency_check(24, false).await;
    assert_eq!(report.checks["async_job_settlement"].inconsistent_count, 2);
    assert!(ledger.list_records_for_request(succeeded).await.unwrap().is_empty());

    let report = ctx.state.consistency.run_full_consistency_check(24, true).await;
    let check = &report.checks["async_job_settlement"];
    assert_eq!((check.inconsistent_count, check.fixed_count), (2, 2));

    let records = ledger.list_records_for_request(succeeded).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount_nano_usd, -50_000_000);
    assert!(ledger.get_usage_log_by_request_id(succeeded).await.unwrap().unwrap().is_billed);

    let log = ledger.get_usage_log_by_request_id(failed).await.unwrap().unwrap();
    assert_eq!(log.stage, BillingStage::Error);
    assert!(!log.is_billed);
    assert!(ledger.list_records_for_request(failed).await.unwrap().is_empty());
    assert_eq!(balance(&ctx).await, 1_000_000_000 - 50_000_000);

    let report = ctx.state.consistency.run_full_consistency_check(24, true).await;
    assert_eq!(report.total_inconsistent(), 0);
    assert_eq!(ledger.list_records_for_request(succeeded).await.unwrap().len(), 1);
}

#[tokio::test]
async fn follow_up_action_uses_parent_upstream_button() {
    let ctx = setup().await;
    let (_, body) = json_post(&ctx, "/mj/submit/imagine", json!({"prompt": "a red fox"})).await;
    let parent: Value = serde_json::from_str(&body).unwrap();
    let parent_id = parent["result"].as_str().unwrap().to_string();
    ctx.state.jobs.process_job(&parent_id).await;
    ctx.state.jobs.poll_once().await;

    let (status, body) = json_post(
        &ctx,
        "/mj/submit/action",
        json!({"taskId": parent_id, "customId": format!("MJ::JOB::upsample::1::{parent_id}")}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let child: Value = serde_json::from_str(&body).unwrap();
    let child_id = child["result"].as_str().unwrap().to_string();
    assert_ne!(child_id, parent_id);
    ctx.state.jobs.process_job(&child_id).await;

    let captured = ctx.captured_headers.lock().unwrap().clone();
    let (_, upstream_body) = captured
        .iter()
        .find(|(name, _)| name == "mj-submit-action")
        .unwrap();
    let upstream_body: Value = serde_json::from_str(upstream_body).unwrap();
    assert_eq!(upstream_body["taskId"], "up-task-1");
    assert_eq!(upstream_body["customId"], "MJ::JOB::upsample::1::up-task-1::SOLO");
    assert!(captured.contains(&("mj-api-secret".to_string(), "mj-relay-key".to_string())));
}

#[tokio::test]
async fn job_cancel_fails_job_without_charge() {
    let ctx = setup().await;
    let (_, body) = json_post(&ctx, "/mj/submit/imagine", json!({"prompt": "a cat"})).await;
    let job_id = serde_json::from_str::<Value>(&body).unwrap()["result"]
        .as_str()
        .unwrap()
        .to_string();
    let (status, body) = json_post(&ctx, "/mj/submit/cancel", json!({"taskId": job_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("failed"));

    let (_, body) = get_json(&ctx, &format!("/mj/task/{job_id}/fetch")).await;
    let view: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["failReason"], "Cancelled by user");
    let ledger = ctx.state.billing.ledger();
    assert!(ledger.list_records_for_request(&job_id).await.unwrap().is_empty());
    let log = ledger.get_usage_log_by_request_id(&job_id).await.unwrap().unwrap();
    assert_eq!(log.stage, BillingStage::Error);
}

#[tokio::test]
async fn job_validation_and_ownership() {
    let ctx = setup().await;
    let (status, body) = json_post(&ctx, "/mj/submit/imagine", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("MISSING_PROMPT"));

    let (status, _) = get_json(&ctx, "/mj/task/does-not-exist/fetch").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = json_post(&ctx, "/mj/submit/imagine", json!({"prompt": "mine"})).await;
    let job_id = serde_json::from_str::<Value>(&body).unwrap()["result"]
        .as_str()
        .unwrap()
        .to_string();
    let other = ctx.state.user_store.create_user("other").await.unwrap();
    let (_, token) = ctx.state.user_store.create_api_key(&other.id, "k").await.unwrap();
    let req = Request::builder()
        .method("GET")
        .uri(format!("/mj/task/{job_id}/fetch"))
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_consistency_run_requires_token() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/admin/consistency/run?window_hours=1&auto_fix=false")
        .header(AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("POST")
        .uri("/admin/consistency/run?window_hours=1&auto_fix=false")
        .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_str(&body).unwrap();
    assert!(report["checks"]["unbilled_usage_logs"].is_object());
    assert!(report["checks"]["billing_record_consistency"].is_object());
    assert!(report["checks"]["user_balance_consistency"].is_object());
    assert_eq!(report["auto_fix"], false);
}

#[tokio::test]
async fn admin_refund_is_idempotent() {
    let ctx = setup().await;
    let (_, _, request_id) = json_post_with_id(
        &ctx,
        "/v1/chat/completions",
        "req-refund",
        json!({"model": "gpt-4o", "prompt": "x"}),
    )
    .await;
    wait_for_billed_log(&ctx, &request_id).await;
    let after_charge = balance(&ctx).await;

    for _ in 0..2 {
        let (status, _) = admin_send(
            &ctx,
            "POST",
            "/admin/compensation/refund",
            json!({"request_id": request_id, "amount_nano_usd": "10000", "reason": "bad answer"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(balance(&ctx).await, after_charge + 10_000);

    let (status, body) = admin_send(
        &ctx,
        "POST",
        "/admin/compensation/refund",
        json!({"request_id": request_id, "amount_nano_usd": "20000", "reason": "more"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("compensation_conflict"));
    assert_eq!(balance(&ctx).await, after_charge + 10_000);
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let ctx = setup().await;
    json_post(&ctx, "/v1/chat/completions", json!({"model": "gpt-4o", "prompt": "x"})).await;
    let (status, body) = get_json(&ctx, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("relaymeter_upstream_requests_total"));
}

async fn admin_send(ctx: &TestContext, method: &str, path: &str, body: Value) -> (StatusCode, String) {
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    send(ctx, req).await
}

#[tokio::test]
async fn admin_topup_in_dollars_and_provider_disable() {
    let ctx = setup().await;
    let (status, body) = admin_send(
        &ctx,
        "POST",
        &format!("/admin/users/{}/topup", ctx.user_id),
        json!({"amount_usd": "1.5", "description": "manual"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["balance_usd"], "2.5");
    assert_eq!(balance(&ctx).await, 2_500_000_000);

    let providers = ctx.state.provider_store.list_providers().await.unwrap();
    let secondary = providers.iter().find(|p| p.slug == "secondary").unwrap();
    let (status, body) = admin_send(
        &ctx,
        "PUT",
        &format!("/admin/providers/{}/state", secondary.id),
        json!({"status": "disabled"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"status\":\"disabled\""));
    let (status, _) = json_post(&ctx, "/v1/chat/completions", json!({"model": "gpt-4o", "prompt": "x"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = admin_send(
        &ctx,
        "GET",
        &format!("/admin/consistency/users/{}", ctx.user_id),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["consistent"], true);
}
