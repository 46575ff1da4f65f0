use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures raised by the routing, proxy and job core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("no provider configured for model {0}")]
    NoProviderForModel(String),
    #[error("no available provider for model {0}")]
    NoAvailableProvider(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: StatusCode, body: String },
    #[error("job {0} is already in a terminal state")]
    JobAlreadyTerminal(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("callback secret does not match the job's provider")]
    CallbackUnauthorized,
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NoProviderForModel(model) => AppError::new(
                StatusCode::NOT_FOUND,
                "model_not_found",
                format!("no provider is configured for model {model}"),
            )
            .with_type("configuration_error")
            .with_param("model"),
            GatewayError::NoAvailableProvider(model) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_available_provider",
                format!("no provider is currently available for model {model}"),
            )
            .with_type("availability_error"),
            GatewayError::UpstreamUnavailable(_) => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_unavailable",
                "upstream request failed",
            )
            .with_type("upstream_error"),
            GatewayError::UpstreamStatus { .. } => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_error",
                "upstream request failed",
            )
            .with_type("upstream_error"),
            GatewayError::JobAlreadyTerminal(job_id) => AppError::new(
                StatusCode::BAD_REQUEST,
                "job_already_terminal",
                format!("job {job_id} already completed"),
            ),
            GatewayError::JobNotFound(job_id) => AppError::new(
                StatusCode::NOT_FOUND,
                "job_not_found",
                format!("job {job_id} not found"),
            ),
            GatewayError::CallbackUnauthorized => AppError::new(
                StatusCode::UNAUTHORIZED,
                "invalid_callback_secret",
                "callback secret is missing or wrong",
            )
            .with_type("authentication_error"),
            GatewayError::Validation { code, message } => {
                AppError::new(StatusCode::BAD_REQUEST, code, message)
            }
            GatewayError::Storage(message) => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                message,
            )
            .with_type("server_error"),
        }
    }
}
