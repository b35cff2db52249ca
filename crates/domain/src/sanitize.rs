//! Log and event sanitization.
//!
//! Everything that reaches the audit log or the event stream passes through
//! here first: sensitive keys are redacted, inline secrets masked, apparent
//! binary payloads replaced, and long strings truncated with an elided-byte
//! count.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const REDACTED_SENSITIVE: &str = "<redacted:sensitive>";
const REDACTED_BINARY: &str = "<redacted:binary-payload>";

fn sensitive_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(token|secret|password|passwd|api[_-]?key|access[_-]?key|private[_-]?key|authorization|bearer)",
        )
        .unwrap()
    })
}

fn inline_assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(api[_-]?key|token|secret|password)\b\s*[:=]\s*([^\s,;]+)").unwrap()
    })
}

fn authorization_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(authorization)\b\s*[:=]\s*(bearer\s+[^\s,;]+)").unwrap()
    })
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bbearer\s+[a-z0-9._~+/=-]{12,}").unwrap())
}

fn base64_body_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=\s]+$").unwrap())
}

/// Whether a string looks like an inline binary payload (data URL or a long
/// run of base64 alphabet).
pub fn looks_binary(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("data:image/") || lower.starts_with("data:application/octet-stream") {
        return true;
    }
    if lower.contains("base64,") && value.len() > 120 {
        return true;
    }
    value.len() > 800 && base64_body_re().is_match(value)
}

fn mask_inline_secrets(text: &str) -> String {
    let out = authorization_re().replace_all(text, |caps: &regex::Captures<'_>| {
        format!("{}={REDACTED_SENSITIVE}", &caps[1])
    });
    let out = inline_assignment_re().replace_all(&out, |caps: &regex::Captures<'_>| {
        format!("{}={REDACTED_SENSITIVE}", &caps[1])
    });
    let out = bearer_re().replace_all(&out, format!("Bearer {REDACTED_SENSITIVE}").as_str());
    out.into_owned()
}

/// Sanitize a string: binary replacement, inline masking, then truncation.
pub fn sanitize_str(value: &str, max_len: usize) -> String {
    if looks_binary(value) {
        return REDACTED_BINARY.to_owned();
    }
    let masked = mask_inline_secrets(value);
    truncate_with_marker(&masked, max_len)
}

/// Truncate at a char boundary, appending the elided count.
pub fn truncate_with_marker(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... (truncated, {} more chars)",
        &text[..end],
        text.len() - end
    )
}

/// Recursively sanitize a JSON value for logging or event emission.
pub fn sanitize_value(value: &Value, max_str_len: usize) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if sensitive_key_re().is_match(key) {
                    out.insert(key.clone(), Value::String(REDACTED_SENSITIVE.into()));
                } else {
                    out.insert(key.clone(), sanitize_value(inner, max_str_len));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, max_str_len))
                .collect(),
        ),
        Value::String(s) => Value::String(sanitize_str(s, max_str_len)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_redacted() {
        let value = json!({"api_key": "sk-12345", "query": "hello", "Authorization": "Bearer abc"});
        let out = sanitize_value(&value, 500);
        assert_eq!(out["api_key"], REDACTED_SENSITIVE);
        assert_eq!(out["Authorization"], REDACTED_SENSITIVE);
        assert_eq!(out["query"], "hello");
    }

    #[test]
    fn inline_assignment_masked() {
        let out = sanitize_str("curl -H api_key=sk-abcdef123 http://x", 500);
        assert!(!out.contains("sk-abcdef123"));
        assert!(out.contains(REDACTED_SENSITIVE));
    }

    #[test]
    fn bearer_token_masked() {
        let out = sanitize_str("Authorization: Bearer abcdefghijklmnop", 500);
        assert!(!out.contains("abcdefghijklmnop"));
    }

    #[test]
    fn data_url_replaced() {
        let out = sanitize_str("data:image/png;base64,AAAABBBB", 500);
        assert_eq!(out, REDACTED_BINARY);
    }

    #[test]
    fn long_base64_run_replaced() {
        let payload = "QUJD".repeat(300);
        assert!(looks_binary(&payload));
        assert_eq!(sanitize_str(&payload, 5000), REDACTED_BINARY);
    }

    #[test]
    fn truncation_reports_elided_count() {
        let out = sanitize_str(&"x".repeat(600), 500);
        assert!(out.ends_with("(truncated, 100 more chars)"));
    }

    #[test]
    fn truncation_respects_char_boundary() {
        let text = format!("{}é", "a".repeat(499));
        // 'é' starts at byte 499 and is 2 bytes; cutting at 500 would split it.
        let out = truncate_with_marker(&text, 500);
        assert!(out.starts_with(&"a".repeat(499)));
        assert!(out.contains("truncated"));
    }

    #[test]
    fn nested_structures_sanitized() {
        let value = json!({"outer": [{"password": "hunter2"}, "plain"]});
        let out = sanitize_value(&value, 500);
        assert_eq!(out["outer"][0]["password"], REDACTED_SENSITIVE);
        assert_eq!(out["outer"][1], "plain");
    }
}
