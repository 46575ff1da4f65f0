use crate::auth::AuthState;
use crate::billing::compensation::CompensationStore;
use crate::billing::{
    AuditLogger, BillingManager, CompensationService, ConsistencyChecker, LedgerStore,
    PricingStore, QuotaStore,
};
use crate::error::{AppError, AppResult};
use crate::jobs::client::MjClient;
use crate::jobs::store::JobStore;
use crate::jobs::{JobEngine, JobEngineConfig};
use crate::providers::ProviderStore;
use crate::selector::ProviderSelector;
use crate::users::UserStore;
use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tokio::time::sleep;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub user_store: UserStore,
    pub provider_store: ProviderStore,
    pub pricing_store: PricingStore,
    pub quota_store: QuotaStore,
    pub selector: ProviderSelector,
    pub billing: BillingManager,
    pub compensation: CompensationService,
    pub consistency: ConsistencyChecker,
    pub jobs: JobEngine,
    pub job_store: JobStore,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub request_timeout_ms: u64,
    pub stream_queue_capacity: usize,
    /// 0 disables the scheduled check.
    pub consistency_interval_secs: u64,
    pub consistency_window_hours: i64,
    pub consistency_auto_fix: bool,
    /// 0 disables the workers and the poller.
    pub job_workers: usize,
    pub job_queue_size: usize,
    pub job_poll_interval_ms: u64,
    pub job_max_poll_attempts: i64,
    pub job_model: String,
    pub admin_token: Option<String>,
    pub compensation_retry_attempts: u32,
    pub compensation_retry_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            database_dsn: "sqlite://./data/relaymeter.db".to_string(),
            request_timeout_ms: 60_000,
            stream_queue_capacity: 100,
            consistency_interval_secs: 3600,
            consistency_window_hours: 24,
            consistency_auto_fix: true,
            job_workers: 3,
            job_queue_size: 1000,
            job_poll_interval_ms: 5000,
            job_max_poll_attempts: 60,
            job_model: "midjourney".to_string(),
            admin_token: None,
            compensation_retry_attempts: 3,
            compensation_retry_interval_ms: 1000,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen: env_string("RELAYMETER_LISTEN").unwrap_or(defaults.listen),
            metrics_path: env_string("RELAYMETER_METRICS_PATH").unwrap_or(defaults.metrics_path),
            database_dsn: resolve_database_dsn(),
            request_timeout_ms: env_parse(
                "RELAYMETER_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
            stream_queue_capacity: env_parse(
                "RELAYMETER_STREAM_QUEUE_CAPACITY",
                defaults.stream_queue_capacity,
            ),
            consistency_interval_secs: env_parse(
                "RELAYMETER_CONSISTENCY_INTERVAL_SECS",
                defaults.consistency_interval_secs,
            ),
            consistency_window_hours: env_parse(
                "RELAYMETER_CONSISTENCY_WINDOW_HOURS",
                defaults.consistency_window_hours,
            ),
            consistency_auto_fix: env_parse(
                "RELAYMETER_CONSISTENCY_AUTO_FIX",
                defaults.consistency_auto_fix,
            ),
            job_workers: env_parse("RELAYMETER_JOB_WORKERS", defaults.job_workers),
            job_queue_size: env_parse("RELAYMETER_JOB_QUEUE_SIZE", defaults.job_queue_size),
            job_poll_interval_ms: env_parse(
                "RELAYMETER_JOB_POLL_INTERVAL_MS",
                defaults.job_poll_interval_ms,
            ),
            job_max_poll_attempts: env_parse(
                "RELAYMETER_JOB_MAX_POLL_ATTEMPTS",
                defaults.job_max_poll_attempts,
            ),
            job_model: env_string("RELAYMETER_JOB_MODEL").unwrap_or(defaults.job_model),
            admin_token: env_string("RELAYMETER_ADMIN_TOKEN"),
            compensation_retry_attempts: env_parse(
                "RELAYMETER_COMPENSATION_RETRY_ATTEMPTS",
                defaults.compensation_retry_attempts,
            ),
            compensation_retry_interval_ms: env_parse(
                "RELAYMETER_COMPENSATION_RETRY_INTERVAL_MS",
                defaults.compensation_retry_interval_ms,
            ),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

fn init_failed(code: &'static str) -> impl Fn(String) -> AppError {
    move |err| AppError::new(StatusCode::BAD_REQUEST, code, err)
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("relaymeter/0.1")
        .build()
        .map_err(|err| init_failed("http_client_init_failed")(err.to_string()))?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(init_failed("database_init_failed"))?;

    // every connection to an in-memory database is a separate database
    let max_connections = if is_memory_dsn(&runtime.database_dsn) { 1 } else { 5 };
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| init_failed("database_dsn_parse_failed")(err.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| init_failed("database_init_failed")(err.to_string()))?;

    let user_store = UserStore::new(pool.clone())
        .await
        .map_err(init_failed("user_store_init_failed"))?;
    let provider_store = ProviderStore::new(pool.clone())
        .await
        .map_err(init_failed("provider_store_init_failed"))?;
    let ledger = LedgerStore::new(pool.clone())
        .await
        .map_err(init_failed("ledger_store_init_failed"))?;
    let pricing_store = PricingStore::new(pool.clone())
        .await
        .map_err(init_failed("pricing_store_init_failed"))?;
    let quota_store = QuotaStore::new(pool.clone())
        .await
        .map_err(init_failed("quota_store_init_failed"))?;
    let compensation_store = CompensationStore::new(pool.clone())
        .await
        .map_err(init_failed("compensation_store_init_failed"))?;
    let job_store = JobStore::new(pool)
        .await
        .map_err(init_failed("job_store_init_failed"))?;

    let metrics = init_metrics()?;

    let audit = AuditLogger::default();
    let selector = ProviderSelector::new(Arc::new(provider_store.clone()));
    let billing = BillingManager::new(
        user_store.clone(),
        ledger.clone(),
        pricing_store.clone(),
        quota_store.clone(),
        audit.clone(),
    );
    let compensation = CompensationService::new(
        compensation_store,
        billing.clone(),
        runtime.compensation_retry_attempts,
        Duration::from_millis(runtime.compensation_retry_interval_ms),
    );
    let consistency = ConsistencyChecker::new(
        ledger,
        user_store.clone(),
        compensation.clone(),
        audit,
    )
    .with_job_outcomes(Arc::new(job_store.clone()));
    let jobs = JobEngine::new(
        job_store.clone(),
        selector.clone(),
        provider_store.clone(),
        MjClient::new(http.clone(), runtime.request_timeout_ms),
        billing.clone(),
        JobEngineConfig {
            workers: runtime.job_workers,
            queue_size: runtime.job_queue_size,
            poll_interval: Duration::from_millis(runtime.job_poll_interval_ms.max(1)),
            max_poll_attempts: runtime.job_max_poll_attempts.max(1),
            model: runtime.job_model.clone(),
        },
    );
    jobs.start().await;

    if runtime.consistency_interval_secs > 0 {
        let checker = consistency.clone();
        let interval = Duration::from_secs(runtime.consistency_interval_secs);
        let window_hours = runtime.consistency_window_hours;
        let auto_fix = runtime.consistency_auto_fix;
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let report = checker
                    .run_full_consistency_check(window_hours, auto_fix)
                    .await;
                tracing::debug!(
                    summary = %report.summary,
                    duration_ms = report.duration_ms,
                    "scheduled consistency check done"
                );
            }
        });
    }

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth: AuthState::new(user_store.clone()),
        http,
        metrics,
        user_store,
        provider_store,
        pricing_store,
        quota_store,
        selector,
        billing,
        compensation,
        consistency,
        jobs,
        job_store,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn resolve_database_dsn() -> String {
    env_string("RELAYMETER_DATABASE_DSN")
        .or_else(|| env_string("DATABASE_URL"))
        .unwrap_or_else(|| RuntimeConfig::default().database_dsn)
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") || is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let mut router = build_proxy_router(&metrics_path).merge(build_job_router());
    if state.runtime.admin_token.is_some() {
        router = router.merge(build_admin_router());
    }
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router
        .with_state(state)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(middleware::from_fn(demote_client_request_id))
        .layer(TraceLayer::new_for_http())
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-client-request-id";

/// The request id keys billing, so it is always minted here. A caller's own
/// id survives only as a correlation header.
async fn demote_client_request_id(mut req: Request, next: Next) -> Response {
    if let Some(client_id) = req.headers_mut().remove(REQUEST_ID_HEADER) {
        req.headers_mut()
            .insert(HeaderName::from_static(CLIENT_REQUEST_ID_HEADER), client_id);
    }
    next.run(req).await
}

fn build_proxy_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/messages", post(crate::handlers::create_messages))
        .route("/v1/completions", post(crate::handlers::create_completions))
        .route(metrics_path, get(crate::handlers::metrics))
}

fn build_job_router() -> Router<AppState> {
    Router::new()
        .route(
            "/mj/submit/cancel",
            post(crate::job_handlers::cancel_job),
        )
        .route(
            "/mj/submit/{action}",
            post(crate::job_handlers::submit_job),
        )
        .route(
            "/mj/task/{id}/fetch",
            get(crate::job_handlers::fetch_job),
        )
        .route("/mj/callback", post(crate::job_handlers::job_callback))
}

fn build_admin_router() -> Router<AppState> {
    Router::new()
        .route(
            "/admin/consistency/run",
            post(crate::admin_handlers::run_consistency_check),
        )
        .route(
            "/admin/consistency/users/{user_id}",
            get(crate::admin_handlers::check_user_balance),
        )
        .route(
            "/admin/compensation/retry/{usage_log_id}",
            post(crate::admin_handlers::retry_missed_charge),
        )
        .route(
            "/admin/compensation/refund",
            post(crate::admin_handlers::refund),
        )
        .route(
            "/admin/compensation/adjust",
            post(crate::admin_handlers::adjust_balance),
        )
        .route(
            "/admin/compensation/tasks/{user_id}",
            get(crate::admin_handlers::list_compensation_tasks),
        )
        .route("/admin/users", post(crate::admin_handlers::create_user))
        .route(
            "/admin/users/{user_id}/api-keys",
            post(crate::admin_handlers::create_api_key),
        )
        .route(
            "/admin/users/{user_id}/topup",
            post(crate::admin_handlers::topup),
        )
        .route(
            "/admin/providers",
            post(crate::admin_handlers::create_provider),
        )
        .route(
            "/admin/providers/{provider_id}/state",
            put(crate::admin_handlers::set_provider_state),
        )
        .route(
            "/admin/model-support",
            put(crate::admin_handlers::upsert_model_support),
        )
        .route("/admin/pricing", put(crate::admin_handlers::upsert_pricing))
        .route("/admin/quotas", post(crate::admin_handlers::create_quota))
}
