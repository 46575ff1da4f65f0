use axum::http::StatusCode;
use relaymeter::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,relaymeter=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        tracing::error!(code = %err.code, error = %err.message, "relaymeter failed to start");
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

fn startup_error(code: &'static str) -> impl Fn(String) -> AppError {
    move |err| AppError::new(StatusCode::BAD_REQUEST, code, err)
}

async fn run() -> Result<(), AppError> {
    let state = relaymeter::app::load_state().await?;
    let runtime = state.runtime.clone();
    let app = relaymeter::app::build_app(state);
    let addr: std::net::SocketAddr = runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| startup_error("listen_invalid")(err.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed")(err.to_string()))?;
    tracing::info!(
        %addr,
        metrics_path = %runtime.metrics_path,
        job_workers = runtime.job_workers,
        admin_routes = runtime.admin_token.is_some(),
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|err| startup_error("serve_failed")(err.to_string()))?;
    Ok(())
}
