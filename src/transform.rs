//! Outbound payload rewriting and inbound usage extraction.

use crate::config::ProviderFamily;
use crate::providers::ProviderCandidate;
use serde::Serialize;
use serde_json::map::Entry;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Cost reported by the upstream itself, if any.
    pub cost_used: Option<f64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cost_used: None,
        }
    }
}

struct UsageKeys {
    input: &'static [&'static str],
    output: &'static [&'static str],
    total: &'static [&'static str],
}

const OPENAI_KEYS: UsageKeys = UsageKeys {
    input: &["prompt_tokens", "input_tokens"],
    output: &["completion_tokens", "output_tokens"],
    total: &["total_tokens"],
};

const ANTHROPIC_KEYS: UsageKeys = UsageKeys {
    input: &["input_tokens", "prompt_tokens"],
    output: &["output_tokens", "completion_tokens"],
    total: &["total_tokens"],
};

fn usage_keys(family: ProviderFamily) -> &'static UsageKeys {
    match family {
        ProviderFamily::Anthropic => &ANTHROPIC_KEYS,
        ProviderFamily::OpenAi | ProviderFamily::Midjourney => &OPENAI_KEYS,
    }
}

#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub path: String,
    pub body: Value,
}

/// Rewrites a caller payload for the chosen provider. Caller-supplied values
/// are never overridden by configured defaults.
pub fn transform_request(
    candidate: &ProviderCandidate,
    path: &str,
    mut body: Map<String, Value>,
) -> TransformedRequest {
    let upstream_model = candidate.upstream_model();
    if body.get("model").and_then(|v| v.as_str()) != Some(upstream_model) {
        body.insert(
            "model".to_string(),
            Value::String(upstream_model.to_string()),
        );
    }

    // A caller who already sent the target name keeps that value; the
    // source value is dropped.
    let config = &candidate.support.config;
    for (from, to) in &config.parameter_mapping {
        if from == to {
            continue;
        }
        let Some(value) = body.remove(from) else {
            continue;
        };
        match body.entry(to.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(_) => {
                tracing::debug!(
                    from = %from,
                    to = %to,
                    "mapped parameter already present, dropping source value"
                );
            }
        }
    }

    if let Some(max_tokens) = config.max_tokens {
        let key = mapped_name(config, "max_tokens");
        if !body.contains_key("max_tokens") && !body.contains_key(key) {
            body.insert(key.to_string(), Value::from(max_tokens));
        }
    }
    if let Some(temperature) = config.temperature {
        let key = mapped_name(config, "temperature");
        if !body.contains_key("temperature") && !body.contains_key(key) {
            if let Some(number) = serde_json::Number::from_f64(temperature) {
                body.insert(key.to_string(), Value::Number(number));
            }
        }
    }

    TransformedRequest {
        path: candidate.provider.family.endpoint_for(path),
        body: Value::Object(body),
    }
}

fn mapped_name<'a>(config: &'a crate::config::ModelConfig, name: &'a str) -> &'a str {
    config
        .parameter_mapping
        .get(name)
        .map(String::as_str)
        .unwrap_or(name)
}

/// Finds a usage block in an upstream response body or stream chunk.
pub fn extract_usage(family: ProviderFamily, value: &Value) -> Option<Usage> {
    let keys = usage_keys(family);
    let block = value
        .get("usage")
        .filter(|v| v.is_object())
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))
        .filter(|v| v.is_object())?;

    let input = first_u64(block, keys.input);
    let output = first_u64(block, keys.output);
    let total = first_u64(block, keys.total);
    if input.is_none() && output.is_none() && total.is_none() {
        return None;
    }
    let input_tokens = input.unwrap_or(0);
    let output_tokens = output.unwrap_or(0);
    let cost_used = value
        .get("cost")
        .or_else(|| block.get("cost"))
        .and_then(|v| v.as_f64());
    Some(Usage {
        input_tokens,
        output_tokens,
        total_tokens: total.unwrap_or_else(|| input_tokens.saturating_add(output_tokens)),
        cost_used,
    })
}

fn first_u64(block: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| block.get(*k).and_then(|v| v.as_u64()))
}

/// Text emitted by one streaming chunk, used for estimation.
pub fn extract_stream_text(family: ProviderFamily, chunk: &Value) -> Option<String> {
    match family {
        ProviderFamily::Anthropic => chunk
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        ProviderFamily::OpenAi | ProviderFamily::Midjourney => {
            let choice = chunk.get("choices")?.get(0)?;
            choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str())
                .or_else(|| choice.get("text").and_then(|v| v.as_str()))
                .map(str::to_string)
        }
    }
}

/// Text of a complete non-streaming response.
pub fn extract_response_text(family: ProviderFamily, body: &Value) -> String {
    match family {
        ProviderFamily::Anthropic => body
            .get("content")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default(),
        ProviderFamily::OpenAi | ProviderFamily::Midjourney => body
            .get("choices")
            .and_then(|v| v.as_array())
            .map(|choices| {
                choices
                    .iter()
                    .filter_map(|c| {
                        c.get("message")
                            .and_then(|m| m.get("content"))
                            .and_then(|v| v.as_str())
                            .or_else(|| c.get("text").and_then(|v| v.as_str()))
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default(),
    }
}
