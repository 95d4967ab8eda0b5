//! `deepeyes-config`: DeepEyes runtime configuration.
//!
//! Provides:
//! - Typed config schema with complete defaults
//! - YAML/TOML read/write with atomic backup rotation
//! - `${ENV_VAR}` substitution and `DEEPEYES_*` overrides
//! - Config redaction for safe logging/display
//! - Validation with path-qualified messages

pub mod env;
pub mod io;
pub mod redact;
pub mod schema;
pub mod validation;

pub use env::{
    apply_env_overrides, apply_env_overrides_with, collect_referenced_vars, resolve_env_vars,
    resolve_env_vars_with, MissingEnvVarError,
};
pub use io::{config_dir, config_file_path, database_path, load_config, load_raw, write_config, ConfigFormat};
pub use redact::{collect_redacted_paths, redact};
pub use schema::{
    DeepEyesConfig, IngestConfig, LoggingConfig, PollConfig, RetryConfig, ServerConfig,
    StorageConfig, VisionConfig, WorkflowConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{Context, Result};
use std::path::Path;

/// Load a config file, substitute `${VAR}` references, apply env overrides
/// and log validation findings.
///
/// This is the main entry point for loading a config at runtime. Validation
/// errors are logged, not returned; callers decide which sections they need.
pub async fn load_and_prepare(path: &Path) -> Result<(DeepEyesConfig, ValidationReport)> {
    let value = load_raw(path).await?;
    let value = resolve_env_vars(&value).context("Failed to resolve env vars in config")?;

    let mut config: DeepEyesConfig = serde_json::from_value(value)
        .with_context(|| format!("Invalid config at: {}", path.display()))?;
    apply_env_overrides(&mut config)?;

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::debug!(path = %error.path, message = %error.message, "Config error");
    }

    Ok((config, report))
}
