//! Masking of secret fields before a JSON value reaches a log line.
//!
//! Keys are matched case-insensitively against a fixed deny list, at any
//! depth. Everything else is logged as is.

use serde_json::Value;

/// Replacement for masked values
pub const MASK: &str = "[REDACTED]";

/// Field names whose values are never logged
const DENY_LIST: &[&str] = &[
    "access_token",
    "accesstoken",
    "refresh_token",
    "refreshtoken",
    "user_seq_no",
    "userseqno",
    "subject_id",
    "password",
    "authorization",
    "cookie",
    "client_secret",
    "code",
    "token",
];

/// Returns true if values under `key` must be masked.
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    DENY_LIST.contains(&key.as_str())
}

/// Returns a copy of `value` with every denied field replaced by [`MASK`].
pub fn mask_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_sensitive_key(k) {
                        Value::String(MASK.to_string())
                    } else {
                        mask_json(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_json).collect()),
        other => other.clone(),
    }
}

/// Masks a raw body for logging. Non-JSON bodies are summarized by length only.
pub fn mask_body(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => mask_json(&value).to_string(),
        Err(_) => format!("<{} bytes>", body.len()),
    }
}
