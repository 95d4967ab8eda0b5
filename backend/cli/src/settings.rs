//! Effective runtime settings: the loaded config file plus the typed policies
//! the library crates expect.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use deepeyes_config::{
    DeepEyesConfig, LoggingConfig, PollConfig, RetryConfig, ValidationReport, VisionConfig,
    WorkflowConfig,
};
use deepeyes_logging::LogOptions;
use deepeyes_runtime::{OrchestratorConfig, RetryPolicy};
use deepeyes_vision::VisionClientConfig;
use deepeyes_workflow::{AnalysisSettings, PollPolicy};

pub struct Settings {
    pub config: DeepEyesConfig,
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub report: ValidationReport,
}

impl Settings {
    /// Load `<config dir>/config.yaml` (or the explicit path) with env
    /// substitution and overrides applied.
    pub async fn load(explicit: Option<PathBuf>) -> Result<Self> {
        let config_dir = deepeyes_config::config_dir();
        let config_path =
            explicit.unwrap_or_else(|| deepeyes_config::config_file_path(&config_dir));
        let (config, report) = deepeyes_config::load_and_prepare(&config_path).await?;
        Ok(Self {
            config,
            config_dir,
            config_path,
            report,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        deepeyes_config::database_path(&self.config, &self.config_dir)
    }

    /// Fail on config errors. Commands that never talk to the provider pass
    /// `needs_vision = false` so missing credentials do not block them.
    pub fn ensure_valid(&self, needs_vision: bool) -> Result<()> {
        let blocking: Vec<String> = self
            .report
            .errors
            .iter()
            .filter(|e| needs_vision || !e.path.starts_with("vision"))
            .map(ToString::to_string)
            .collect();
        if !blocking.is_empty() {
            bail!("Invalid configuration ({}):\n  {}", self.config_path.display(), blocking.join("\n  "));
        }
        Ok(())
    }

    pub fn log_options(&self) -> LogOptions {
        log_options(&self.config.logging, &self.config_dir)
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            retry: retry_policy(&self.config.workflow.retry),
            poll: poll_policy(&self.config.workflow.poll),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        orchestrator_config(&self.config.workflow)
    }

    pub fn vision_client_config(&self) -> VisionClientConfig {
        vision_client_config(&self.config.vision)
    }
}

pub fn log_options(logging: &LoggingConfig, config_dir: &std::path::Path) -> LogOptions {
    LogOptions {
        level: logging.level.clone(),
        dir: logging.dir.as_ref().map(|dir| {
            let dir = PathBuf::from(dir);
            if dir.is_absolute() { dir } else { config_dir.join(dir) }
        }),
        json: logging.json,
    }
}

pub fn retry_policy(retry: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: retry.max_attempts.max(1),
        base_delay_ms: retry.base_delay_ms,
        backoff_factor: retry.backoff_factor,
        max_delay_ms: retry.max_delay_ms,
        jitter: retry.jitter,
    }
}

pub fn poll_policy(poll: &PollConfig) -> PollPolicy {
    PollPolicy {
        initial_delay_ms: poll.initial_delay_ms,
        factor: poll.factor,
        max_delay_ms: poll.max_delay_ms,
        max_attempts: poll.max_attempts.max(1),
        max_total_wait_ms: poll.max_total_wait_secs.saturating_mul(1_000),
    }
}

pub fn orchestrator_config(workflow: &WorkflowConfig) -> OrchestratorConfig {
    OrchestratorConfig {
        lease_ttl: Duration::from_secs(workflow.lease_ttl_secs.max(1)),
        prune_completed_steps: workflow.prune_completed_steps,
        ..Default::default()
    }
}

pub fn vision_client_config(vision: &VisionConfig) -> VisionClientConfig {
    VisionClientConfig {
        request_timeout: Duration::from_secs(vision.request_timeout_secs.max(1)),
        api_version: vision.api_version.clone(),
        ..VisionClientConfig::new(vision.endpoint.clone(), vision.api_key.clone())
    }
}
