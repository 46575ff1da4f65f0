use crate::providers::Provider;
use crate::upstream::{self, UpstreamCallError, UpstreamErrorKind};
use axum::http::Method;
use serde_json::Value;

/// Submit codes an upstream uses for an accepted task.
const ACCEPTED_CODES: [i64; 3] = [1, 21, 22];

/// Result of one upstream fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTask {
    pub status: String,
    pub progress: Option<i64>,
    pub image_url: Option<String>,
    pub fail_reason: Option<String>,
    pub buttons: Value,
}

#[derive(Clone)]
pub struct MjClient {
    http: reqwest::Client,
    timeout_ms: u64,
}

impl MjClient {
    pub fn new(http: reqwest::Client, timeout_ms: u64) -> Self {
        Self { http, timeout_ms }
    }

    /// Returns the upstream task id.
    pub async fn submit(
        &self,
        provider: &Provider,
        path: &str,
        body: &Value,
    ) -> Result<String, UpstreamCallError> {
        let resp = upstream::call_json(
            &self.http,
            provider,
            Method::POST,
            path,
            Some(body),
            self.timeout_ms,
        )
        .await?;
        let code = resp.get("code").and_then(Value::as_i64).unwrap_or(0);
        let task_id = match resp.get("result") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        match task_id {
            Some(id) if ACCEPTED_CODES.contains(&code) => Ok(id),
            _ => {
                let description = resp
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("submit rejected");
                Err(UpstreamCallError::new(
                    UpstreamErrorKind::Http,
                    None,
                    format!("upstream rejected submission (code {code}): {description}"),
                ))
            }
        }
    }

    pub async fn fetch(
        &self,
        provider: &Provider,
        upstream_task_id: &str,
    ) -> Result<UpstreamTask, UpstreamCallError> {
        let path = format!("/mj/task/{upstream_task_id}/fetch");
        let resp = upstream::call_json(
            &self.http,
            provider,
            Method::GET,
            &path,
            None,
            self.timeout_ms,
        )
        .await?;
        Ok(parse_task(&resp))
    }
}

pub fn parse_task(value: &Value) -> UpstreamTask {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    UpstreamTask {
        status: text("status").unwrap_or_default().to_ascii_uppercase(),
        progress: value.get("progress").and_then(parse_progress),
        image_url: text("imageUrl"),
        fail_reason: text("failReason"),
        buttons: value.get("buttons").cloned().unwrap_or(Value::Null),
    }
}

/// Accepts `"45%"`, `"45"` or a number.
pub fn parse_progress(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
    .map(|p: i64| p.clamp(0, 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_formats() {
        assert_eq!(parse_progress(&json!("45%")), Some(45));
        assert_eq!(parse_progress(&json!("7")), Some(7));
        assert_eq!(parse_progress(&json!(130)), Some(100));
        assert_eq!(parse_progress(&json!("")), None);
    }

    #[test]
    fn task_fields_are_normalised() {
        let task = parse_task(&json!({
            "status": "failure",
            "progress": "0%",
            "failReason": "banned prompt",
            "imageUrl": ""
        }));
        assert_eq!(task.status, "FAILURE");
        assert_eq!(task.fail_reason.as_deref(), Some("banned prompt"));
        assert_eq!(task.image_url, None);
    }
}
