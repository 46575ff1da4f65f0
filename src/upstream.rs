use crate::error::GatewayError;
use crate::providers::Provider;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Config,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }
}

impl From<UpstreamCallError> for GatewayError {
    fn from(err: UpstreamCallError) -> Self {
        match (err.kind, err.status) {
            (UpstreamErrorKind::Http, Some(status)) => GatewayError::UpstreamStatus {
                status,
                body: err.message,
            },
            _ => GatewayError::UpstreamUnavailable(err.message),
        }
    }
}

/// Response of a buffered call, body kept byte for byte.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Best-effort parse; a malformed body is not an error.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "mj-api-secret",
    "anthropic-version",
    "host",
    "content-length",
    "content-type",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "accept-encoding",
    "content-encoding",
];

/// Caller headers safe to pass upstream. Credentials are replaced by the
/// provider's own, hop-by-hop and encoding headers are dropped.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub async fn send_request(
    client: &reqwest::Client,
    provider: &Provider,
    method: Method,
    path: &str,
    headers: HeaderMap,
    body: Option<&Value>,
    timeout_ms: Option<u64>,
) -> Result<reqwest::Response, UpstreamCallError> {
    let base = provider
        .base_url
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            UpstreamCallError::new(
                UpstreamErrorKind::Config,
                None,
                "missing base_url".to_string(),
            )
        })?;
    let credential = provider.credential.as_deref().ok_or_else(|| {
        UpstreamCallError::new(UpstreamErrorKind::Config, None, "missing credential".to_string())
    })?;
    let url = join_url(base, path);
    let mut req = client.request(method, url).headers(headers);
    if let Some(timeout_ms) = timeout_ms {
        req = req.timeout(std::time::Duration::from_millis(timeout_ms));
    }
    if let Some(body) = body {
        req = req.json(body);
    }
    req = provider.family.apply_auth(req, credential);

    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(
            provider = %provider.slug,
            status = %status,
            body = %text,
            "upstream returned error status"
        );
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        ));
    }
    Ok(resp)
}

/// Single request/response round trip bounded by `timeout_ms`.
pub async fn forward_buffered(
    client: &reqwest::Client,
    provider: &Provider,
    path: &str,
    headers: HeaderMap,
    body: &Value,
    timeout_ms: u64,
) -> Result<BufferedResponse, UpstreamCallError> {
    let resp = send_request(
        client,
        provider,
        Method::POST,
        path,
        headers,
        Some(body),
        Some(timeout_ms),
    )
    .await?;
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    Ok(BufferedResponse {
        status,
        content_type,
        body,
    })
}

/// Opens a long-lived streaming call. No overall timeout is applied.
pub async fn open_stream(
    client: &reqwest::Client,
    provider: &Provider,
    path: &str,
    mut headers: HeaderMap,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("text/event-stream"),
    );
    send_request(client, provider, Method::POST, path, headers, Some(body), None).await
}

pub async fn call_json(
    client: &reqwest::Client,
    provider: &Provider,
    method: Method,
    path: &str,
    body: Option<&Value>,
    timeout_ms: u64,
) -> Result<Value, UpstreamCallError> {
    let resp = send_request(
        client,
        provider,
        method,
        path,
        HeaderMap::new(),
        body,
        Some(timeout_ms),
    )
    .await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_strips_duplicate_version() {
        assert_eq!(
            join_url("https://api.example.com/v1/", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("http://mj.local", "/mj/submit/imagine"),
            "http://mj.local/mj/submit/imagine"
        );
    }

    #[test]
    fn credentials_and_hop_headers_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-caller".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("x-request-id", "req-1".parse().unwrap());
        headers.insert("openai-organization", "org".parse().unwrap());
        let out = forwardable_headers(&headers);
        assert!(out.get("authorization").is_none());
        assert!(out.get("connection").is_none());
        assert_eq!(out.get("x-request-id").unwrap(), "req-1");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn http_errors_keep_status_for_diagnostics() {
        let err: GatewayError = UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::TOO_MANY_REQUESTS),
            "slow down".to_string(),
        )
        .into();
        assert!(matches!(
            err,
            GatewayError::UpstreamStatus { status, .. } if status == StatusCode::TOO_MANY_REQUESTS
        ));
        let err: GatewayError =
            UpstreamCallError::new(UpstreamErrorKind::Network, None, "reset".to_string()).into();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }
}
