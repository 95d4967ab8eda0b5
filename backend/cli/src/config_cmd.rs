//! `deepeyes init` and `deepeyes config`.

use std::path::Path;

use anyhow::{bail, Result};

use deepeyes_config::{redact, write_config, DeepEyesConfig};

use crate::settings::Settings;
use crate::terminal_output::{note_error, note_info, note_success, note_warn};

/// Write a default config file. An existing file is kept unless `force`.
pub async fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("Config already exists at {} (use --force to overwrite)", path.display());
    }
    let mut config = DeepEyesConfig::default();
    // Point at the env vars so secrets stay out of the file.
    config.vision.endpoint = "${VISION_ENDPOINT}".to_string();
    config.vision.api_key = "${VISION_API_KEY}".to_string();
    write_config(&config, path).await?;
    note_success(&format!("Wrote default config to {}", path.display()));
    note_info("Set VISION_ENDPOINT and VISION_API_KEY before running `deepeyes serve`.");
    Ok(())
}

/// Print the effective config with secrets masked, plus validation findings.
pub fn show(settings: &Settings) -> Result<()> {
    let value = serde_json::to_value(&settings.config)?;
    note_info(&format!("Config file: {}", settings.config_path.display()));
    note_info(&format!("Database: {}", settings.database_path().display()));
    println!("{}", serde_yaml::to_string(&redact(&value))?);

    for warning in &settings.report.warnings {
        note_warn(&warning.to_string());
    }
    for error in &settings.report.errors {
        note_error(&error.to_string());
    }
    if settings.report.is_valid() {
        note_success("Config is valid");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        init(&path, false).await.unwrap();
        assert!(init(&path, false).await.is_err());
        init(&path, true).await.unwrap();

        let written = deepeyes_config::load_config(&path).await.unwrap();
        assert_eq!(written.vision.api_key, "${VISION_API_KEY}");
    }
}
