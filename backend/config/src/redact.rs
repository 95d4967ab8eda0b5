//! Config redaction: safe-to-share snapshots with credentials masked.

use serde_json::Value;

static SENSITIVE_KEYS: &[&str] = &[
    "apiKey",
    "api_key",
    "subscriptionKey",
    "subscription_key",
    "accessToken",
    "access_token",
    "token",
    "secret",
    "password",
];

/// Redact a config value, keeping a 4-character hint of each secret.
pub fn redact(value: &Value) -> Value {
    redact_recursive(value, "")
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

fn mask(s: &str) -> String {
    if s.chars().count() > 4 {
        format!("{}***", s.chars().take(4).collect::<String>())
    } else {
        "***".to_string()
    }
}

fn redact_recursive(value: &Value, key: &str) -> Value {
    match value {
        Value::String(s) if is_sensitive_key(key) && !s.is_empty() => Value::String(mask(s)),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| redact_recursive(v, key)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_recursive(v, k)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Dotted paths of every field `redact` would mask.
pub fn collect_redacted_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths_recursive(value, "", &mut paths);
    paths
}

fn collect_paths_recursive(value: &Value, path: &str, out: &mut Vec<String>) {
    match value {
        Value::String(s) if !s.is_empty() => {
            let key = path.rsplit('.').next().unwrap_or("");
            if is_sensitive_key(key) {
                out.push(path.to_string());
            }
        }
        Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                collect_paths_recursive(v, &format!("{path}[{i}]"), out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                let child_path = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                collect_paths_recursive(v, &child_path, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_api_key() {
        let v = json!({ "vision": { "endpoint": "https://eyes.example", "apiKey": "0123456789abcdef" } });
        let redacted = redact(&v);
        assert_eq!(redacted["vision"]["apiKey"], "0123***");
        assert_eq!(redacted["vision"]["endpoint"], "https://eyes.example");
    }

    #[test]
    fn short_and_empty_secrets() {
        let v = json!({ "password": "abc", "token": "" });
        let redacted = redact(&v);
        assert_eq!(redacted["password"], "***");
        assert_eq!(redacted["token"], "");
    }

    #[test]
    fn collects_paths() {
        let v = json!({ "vision": { "apiKey": "0123456789" }, "logging": { "level": "debug" } });
        assert_eq!(collect_redacted_paths(&v), vec!["vision.apiKey"]);
    }
}
