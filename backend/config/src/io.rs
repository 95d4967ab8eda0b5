//! Config file read/write. YAML or TOML, chosen by file extension.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::schema::DeepEyesConfig;

/// Default config file name within the config directory.
const CONFIG_FILE_NAME: &str = "config.yaml";

const DATABASE_FILE_NAME: &str = "deepeyes.db";

/// Number of rolling backups to keep.
const MAX_BACKUPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") | None => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            Some(other) => bail!("Unsupported config format '.{other}' (use .yaml or .toml)"),
        }
    }
}

/// Resolve the config directory: `DEEPEYES_CONFIG_DIR`, else `~/.deepeyes`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DEEPEYES_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".deepeyes"))
        .unwrap_or_else(|| PathBuf::from(".deepeyes"))
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Database location: the configured path (relative ones resolve against the
/// config directory) or `deepeyes.db` in the config directory.
pub fn database_path(config: &DeepEyesConfig, config_dir: &Path) -> PathBuf {
    match config.storage.database.as_deref() {
        Some(db) if Path::new(db).is_absolute() || db == ":memory:" => PathBuf::from(db),
        Some(db) => config_dir.join(db),
        None => config_dir.join(DATABASE_FILE_NAME),
    }
}

/// Read the raw config tree. A missing or empty file yields an empty object.
pub async fn load_raw(path: &Path) -> Result<Value> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(Value::Object(Default::default()));
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let value: Value = match ConfigFormat::from_path(path)? {
        ConfigFormat::Yaml => serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?,
        ConfigFormat::Toml => toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config TOML at: {}", path.display()))?,
    };
    info!(path = %path.display(), "Loaded config");
    Ok(match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    })
}

/// Load and deserialize without env processing.
pub async fn load_config(path: &Path) -> Result<DeepEyesConfig> {
    let value = load_raw(path).await?;
    serde_json::from_value(value)
        .with_context(|| format!("Invalid config at: {}", path.display()))
}

pub fn to_string(config: &DeepEyesConfig, format: ConfigFormat) -> Result<String> {
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config).context("Failed to serialize config to YAML"),
        ConfigFormat::Toml => toml::to_string_pretty(config).context("Failed to serialize config to TOML"),
    }
}

/// Write config to disk atomically (temp file + rename), keeping rolling
/// backups of the previous file.
pub async fn write_config(config: &DeepEyesConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    if fs::try_exists(path).await.unwrap_or(false) {
        rotate_backups(path).await;
    }

    let body = to_string(config, ConfigFormat::from_path(path)?)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, body.as_bytes())
        .await
        .with_context(|| format!("Failed to write temp config: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp config to: {}", path.display()))?;

    info!(path = %path.display(), "Wrote config");
    Ok(())
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak.{n}"));
    PathBuf::from(name)
}

/// config.yaml.bak.1 → .bak.2 → … → .bak.N
async fn rotate_backups(path: &Path) {
    for i in (1..MAX_BACKUPS).rev() {
        let old = backup_path(path, i);
        if fs::try_exists(&old).await.unwrap_or(false) {
            if let Err(e) = fs::rename(&old, backup_path(path, i + 1)).await {
                warn!(path = %old.display(), error = %e, "Failed to rotate config backup");
            }
        }
    }
    let bak = backup_path(path, 1);
    if let Err(e) = fs::copy(path, &bak).await {
        warn!(path = %bak.display(), error = %e, "Failed to create config backup");
    }
}
