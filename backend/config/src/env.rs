//! Environment handling for config values.
//!
//! Two passes run at load time: `${VAR_NAME}` references inside string values
//! are substituted (`$${VAR}` stays a literal `${VAR}`), then a fixed set of
//! `DEEPEYES_*` / `VISION_*` variables override individual typed fields.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::schema::DeepEyesConfig;

/// `$${NAME}` (escaped) or `${NAME}`, uppercase names only.
static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\$)?\{([A-Z_][A-Z0-9_]*)\}").expect("valid env reference regex"));

#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute `${VAR}` references in every string of the value tree using the
/// process environment.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    resolve_env_vars_with(value, &std::env::vars().collect())
}

/// Substitute using an explicit variable map.
pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    substitute(value, env, "")
}

fn substitute(value: &Value, env: &HashMap<String, String>, path: &str) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(substitute_str(s, env, path)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| substitute(v, env, &format!("{path}[{i}]")))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                let child = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                out.insert(key.clone(), substitute(v, env, &child)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn substitute_str(s: &str, env: &HashMap<String, String>, path: &str) -> Result<String> {
    if !s.contains("${") {
        return Ok(s.to_string());
    }
    let mut missing: Option<MissingEnvVarError> = None;
    let replaced = REFERENCE.replace_all(s, |caps: &regex::Captures<'_>| {
        let name = &caps[2];
        if caps.get(1).is_some() {
            return format!("${{{name}}}");
        }
        match env.get(name).filter(|v| !v.is_empty()) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: name.to_string(),
                    config_path: path.to_string(),
                });
                String::new()
            }
        }
    });
    if let Some(err) = missing {
        bail!(err);
    }
    Ok(replaced.into_owned())
}

/// Names of all variables referenced in the tree (for diagnostics).
pub fn collect_referenced_vars(value: &Value) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.extend(
                REFERENCE
                    .captures_iter(s)
                    .filter(|c| c.get(1).is_none())
                    .map(|c| c[2].to_string()),
            ),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut vars = Vec::new();
    walk(value, &mut vars);
    vars.sort();
    vars.dedup();
    vars
}

/// Apply `DEEPEYES_BIND`, `DEEPEYES_PORT`, `DEEPEYES_DB`, `VISION_ENDPOINT`,
/// `VISION_API_KEY` and `DEEPEYES_WATCH_DIR` from the process environment.
pub fn apply_env_overrides(config: &mut DeepEyesConfig) -> Result<()> {
    apply_env_overrides_with(config, &std::env::vars().collect())
}

pub fn apply_env_overrides_with(
    config: &mut DeepEyesConfig,
    env: &HashMap<String, String>,
) -> Result<()> {
    let get = |name: &str| env.get(name).filter(|v| !v.trim().is_empty()).cloned();

    if let Some(bind) = get("DEEPEYES_BIND") {
        config.server.bind = bind;
    }
    if let Some(port) = get("DEEPEYES_PORT") {
        config.server.port = port
            .trim()
            .parse()
            .with_context(|| format!("DEEPEYES_PORT is not a valid port: {port}"))?;
    }
    if let Some(db) = get("DEEPEYES_DB") {
        config.storage.database = Some(db);
    }
    if let Some(endpoint) = get("VISION_ENDPOINT") {
        config.vision.endpoint = endpoint;
    }
    if let Some(key) = get("VISION_API_KEY") {
        config.vision.api_key = key;
    }
    if let Some(dir) = get("DEEPEYES_WATCH_DIR") {
        config.ingest.watch_dir = Some(dir);
    }
    debug!("Applied environment overrides");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_nested_strings() {
        let v = json!({"vision": {"apiKey": "${VISION_KEY}", "endpoint": "https://${HOST}/"}});
        let out = resolve_env_vars_with(&v, &env(&[("VISION_KEY", "k-123"), ("HOST", "eyes.example")]))
            .unwrap();
        assert_eq!(out["vision"]["apiKey"], "k-123");
        assert_eq!(out["vision"]["endpoint"], "https://eyes.example/");
    }

    #[test]
    fn missing_var_names_path() {
        let v = json!({"vision": {"apiKey": "${NOPE}"}});
        let err = resolve_env_vars_with(&v, &HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("NOPE"));
        assert!(err.contains("vision.apiKey"));
    }

    #[test]
    fn escaped_reference_is_literal() {
        let v = json!({"note": "$${HOME} stays"});
        let out = resolve_env_vars_with(&v, &HashMap::new()).unwrap();
        assert_eq!(out["note"], "${HOME} stays");
        assert!(collect_referenced_vars(&v).is_empty());
    }

    #[test]
    fn collects_vars() {
        let v = json!({"a": "${FOO}", "b": ["${BAR}", "${FOO}"]});
        assert_eq!(collect_referenced_vars(&v), vec!["BAR", "FOO"]);
    }

    #[test]
    fn overrides_typed_fields() {
        let mut cfg = DeepEyesConfig::default();
        apply_env_overrides_with(
            &mut cfg,
            &env(&[
                ("DEEPEYES_PORT", "9090"),
                ("VISION_ENDPOINT", "https://eyes.example"),
                ("DEEPEYES_WATCH_DIR", "/srv/uploads"),
                ("DEEPEYES_BIND", ""),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.vision.endpoint, "https://eyes.example");
        assert_eq!(cfg.ingest.watch_dir.as_deref(), Some("/srv/uploads"));
    }

    #[test]
    fn bad_port_override() {
        let mut cfg = DeepEyesConfig::default();
        assert!(apply_env_overrides_with(&mut cfg, &env(&[("DEEPEYES_PORT", "eighty")])).is_err());
    }
}
