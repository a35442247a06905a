//! Payload redaction: strip sensitive fields from tool payloads and mask secrets in free text.
//!
//! Applied to every tool output before it is rendered into a user response or sent to the
//! language model, and to any model text before it is returned. Sensitive keys are matched
//! case-insensitively on the JSON field name; inline secrets (connection strings, bearer
//! tokens, `password=...` pairs) are replaced with [`REDACTED_PLACEHOLDER`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Placeholder used in place of any sensitive value.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

const DEFAULT_SENSITIVE_KEYS: [&str; 11] = [
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credential",
    "connection_string",
    "authorization",
    "private_key",
    "raw_body",
];

static INLINE_SECRETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?ix)
        \b(?:postgres(?:ql)?|mysql|mongodb(?:\+srv)?|redis|amqps?|jdbc:[a-z0-9]+|ldaps?|ftp|sftp)://[^\s"'<>]+
        | \bbearer\s+[A-Za-z0-9._~+/=\-]+
        | \b(?:password|passwd|pwd|secret|token|api[_-]?key)\s*[=:]\s*[^\s,;"']+
        "#,
    )
    .expect("inline secret pattern is valid")
});

/// Removes sensitive fields and inline secrets from payloads and text.
#[derive(Debug, Clone)]
pub struct PayloadRedactor {
    sensitive_keys: Vec<String>,
}

impl Default for PayloadRedactor {
    fn default() -> Self {
        Self::from_keys(DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect())
    }
}

impl PayloadRedactor {
    /// Build from a list of key fragments. A field is sensitive when its lowercased name
    /// contains any fragment (`db_password` matches `password`).
    pub fn from_keys(keys: Vec<String>) -> Self {
        Self {
            sensitive_keys: keys
                .into_iter()
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Add project-specific key fragments. Preserves existing ones.
    pub fn with_extra_keys(mut self, keys: &[&str]) -> Self {
        for k in keys {
            let k = k.trim().to_ascii_lowercase();
            if !k.is_empty() && !self.sensitive_keys.contains(&k) {
                self.sensitive_keys.push(k);
            }
        }
        self
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.sensitive_keys.iter().any(|k| key.contains(k.as_str()))
    }

    /// Return a copy of `value` with sensitive fields removed and string leaves masked.
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    if self.is_sensitive_key(k) {
                        continue;
                    }
                    out.insert(k.clone(), self.redact_value(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::String(s) => Value::String(self.mask_text(s)),
            other => other.clone(),
        }
    }

    /// Replace inline secrets in free text.
    pub fn mask_text(&self, text: &str) -> String {
        INLINE_SECRETS
            .replace_all(text, REDACTED_PLACEHOLDER)
            .into_owned()
    }
}
