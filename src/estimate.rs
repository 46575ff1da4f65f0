//! Content-based token estimation used when an upstream reports no usage.
//!
//! Weights per character: CJK unified ideographs count as a full token,
//! ASCII letters and digits as a quarter token, whitespace as nothing (BPE
//! vocabularies fold the leading space into the following word) and every
//! other character as half a token. The sum is rounded half up.

use serde_json::Value;

const CJK_WEIGHT: f64 = 1.0;
const ASCII_ALNUM_WEIGHT: f64 = 0.25;
const OTHER_WEIGHT: f64 = 0.5;

pub fn estimate_tokens(text: &str) -> u64 {
    let mut weight = 0.0f64;
    for ch in text.chars() {
        weight += if ('\u{4E00}'..='\u{9FFF}').contains(&ch) {
            CJK_WEIGHT
        } else if ch.is_ascii_alphanumeric() {
            ASCII_ALNUM_WEIGHT
        } else if ch.is_whitespace() {
            0.0
        } else {
            OTHER_WEIGHT
        };
    }
    (weight + 0.5).floor() as u64
}

/// Concatenates the textual content of a chat or completion payload.
pub fn request_text(payload: &Value) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(system) = payload.get("system").and_then(|v| v.as_str()) {
        parts.push(system);
    }
    if let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(text)) => parts.push(text),
                Some(Value::Array(items)) => {
                    for item in items {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                            parts.push(text);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    match payload.get("prompt") {
        Some(Value::String(prompt)) => parts.push(prompt),
        Some(Value::Array(prompts)) => {
            parts.extend(prompts.iter().filter_map(|v| v.as_str()));
        }
        _ => {}
    }
    parts.join(" ")
}

pub fn estimate_input_tokens(payload: &Value) -> u64 {
    estimate_tokens(&request_text(payload))
}
