use crate::error::GatewayError;
use serde_json::{Map, Value};

/// Per-call value threaded from authentication through billing.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub stream: bool,
    pub payload: Map<String, Value>,
}

impl GatewayRequest {
    pub fn parse(
        request_id: String,
        user_id: String,
        api_key_id: String,
        raw: &[u8],
    ) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_slice(raw).map_err(|err| {
            GatewayError::validation("invalid_request", format!("invalid JSON body: {err}"))
        })?;
        let Value::Object(payload) = value else {
            return Err(GatewayError::validation(
                "invalid_request",
                "request body must be a JSON object",
            ));
        };
        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::validation("MISSING_MODEL", "model is required"))?
            .to_string();
        let has_messages = payload.get("messages").is_some_and(|v| !v.is_null());
        let has_prompt = payload.get("prompt").is_some_and(|v| !v.is_null());
        if !has_messages && !has_prompt {
            return Err(GatewayError::validation(
                "MISSING_INPUT",
                "either messages or prompt is required",
            ));
        }
        let stream = payload
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Self {
            request_id,
            user_id,
            api_key_id,
            model,
            stream,
            payload,
        })
    }

    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<GatewayRequest, GatewayError> {
        GatewayRequest::parse("r".into(), "u".into(), "k".into(), raw.as_bytes())
    }

    fn code(err: GatewayError) -> &'static str {
        match err {
            GatewayError::Validation { code, .. } => code,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_requests() {
        assert_eq!(code(parse("[]").unwrap_err()), "invalid_request");
        assert_eq!(code(parse("{").unwrap_err()), "invalid_request");
        assert_eq!(
            code(parse(r#"{"messages": []}"#).unwrap_err()),
            "MISSING_MODEL"
        );
        assert_eq!(
            code(parse(r#"{"model": "gpt-4o"}"#).unwrap_err()),
            "MISSING_INPUT"
        );
    }

    #[test]
    fn accepts_prompt_or_messages() {
        let req = parse(r#"{"model": "m", "prompt": "hi", "stream": true}"#).unwrap();
        assert!(req.stream);
        assert_eq!(req.model, "m");
        assert!(!parse(r#"{"model": "m", "messages": []}"#).unwrap().stream);
    }
}
