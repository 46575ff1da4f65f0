use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Upstream dialect. Resolved once when a provider row is loaded.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    OpenAi,
    Anthropic,
    Midjourney,
}

impl ProviderFamily {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openai" | "open_ai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "midjourney" => Some(Self::Midjourney),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Midjourney => "midjourney",
        }
    }

    /// Fallback for rows stored before the family column existed.
    pub fn infer(slug: &str, name: &str) -> Self {
        let haystack = format!("{} {}", slug, name).to_ascii_lowercase();
        if haystack.contains("anthropic") || haystack.contains("claude") {
            Self::Anthropic
        } else if haystack.contains("midjourney") || haystack.contains("mj") {
            Self::Midjourney
        } else {
            Self::OpenAi
        }
    }

    pub fn endpoint_for(&self, path: &str) -> String {
        match self {
            Self::Anthropic if path == "/v1/chat/completions" => "/v1/messages".to_string(),
            _ => path.to_string(),
        }
    }

    pub fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
        credential: &str,
    ) -> reqwest::RequestBuilder {
        match self {
            Self::OpenAi => req.bearer_auth(credential),
            Self::Anthropic => req
                .header("x-api-key", credential)
                .header("anthropic-version", ANTHROPIC_VERSION),
            Self::Midjourney => req.header("mj-api-secret", credential),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Disabled,
}

impl ProviderStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ProviderHealth {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Per-model request shaping for one provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Caller parameter name -> upstream parameter name.
    #[serde(default)]
    pub parameter_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl ModelConfig {
    pub fn from_json(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_maps_chat_path_to_messages() {
        assert_eq!(
            ProviderFamily::Anthropic.endpoint_for("/v1/chat/completions"),
            "/v1/messages"
        );
        assert_eq!(
            ProviderFamily::OpenAi.endpoint_for("/v1/chat/completions"),
            "/v1/chat/completions"
        );
    }

    #[test]
    fn infer_family_from_legacy_slug() {
        assert_eq!(
            ProviderFamily::infer("claude-proxy", ""),
            ProviderFamily::Anthropic
        );
        assert_eq!(
            ProviderFamily::infer("mj-302", "Midjourney"),
            ProviderFamily::Midjourney
        );
        assert_eq!(ProviderFamily::infer("azure-eu", ""), ProviderFamily::OpenAi);
    }

    #[test]
    fn model_config_rejects_unknown_fields() {
        assert!(ModelConfig::from_json(r#"{"max_tokens": 10, "bogus": 1}"#).is_err());
        let cfg = ModelConfig::from_json(
            r#"{"parameter_mapping": {"max_tokens": "max_output_tokens"}, "temperature": 0.2}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.parameter_mapping.get("max_tokens").map(String::as_str),
            Some("max_output_tokens")
        );
        assert_eq!(ModelConfig::from_json("").unwrap(), ModelConfig::default());
    }
}
