//! DeepEyes runtime configuration schema.
//!
//! Every section has complete defaults, so an empty or missing file yields a
//! usable configuration apart from the vision credentials.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeepEyesConfig {
    /// HTTP read/operator API
    pub server: ServerConfig,
    /// SQLite database location
    pub storage: StorageConfig,
    /// Vision provider endpoint and credentials
    pub vision: VisionConfig,
    /// Upload directory watcher
    pub ingest: IngestConfig,
    /// Retry, polling and lease settings of the analysis workflow
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Allow any origin on the read API (the web client is served elsewhere).
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            cors: true,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Database file. Relative paths resolve against the config directory;
    /// unset means `deepeyes.db` in the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

// ---------------------------------------------------------------------------
// Vision provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisionConfig {
    /// e.g. `https://<resource>.cognitiveservices.azure.com`
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            api_version: "v3.2".to_string(),
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestConfig {
    /// Directory watched for new uploads. Unset disables the watcher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_dir: Option<String>,
    pub scan_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            watch_dir: None,
            scan_interval_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowConfig {
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub lease_ttl_secs: u64,
    /// How often the server re-scans for unfinished instances nobody is
    /// driving. 0 disables the sweep.
    pub resume_sweep_secs: u64,
    pub prune_completed_steps: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            lease_ttl_secs: 150,
            resume_sweep_secs: 60,
            prune_completed_steps: true,
        }
    }
}

/// Backoff for transient provider failures within one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// OCR polling schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollConfig {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub max_total_wait_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            factor: 1.5,
            max_delay_ms: 15_000,
            max_attempts: 60,
            max_total_wait_secs: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// Directory for daily-rotated NDJSON log files. Unset logs to console only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Emit console output as JSON lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "server:\n  port: 9000\nvision:\n  endpoint: https://eyes.example\n";
        let cfg: DeepEyesConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.vision.api_version, "v3.2");
        assert_eq!(cfg.workflow.poll.factor, 1.5);
        assert!(cfg.workflow.prune_completed_steps);
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(DeepEyesConfig::default()).unwrap();
        assert!(json["vision"].get("apiKey").is_some());
        assert!(json["workflow"]["poll"].get("maxTotalWaitSecs").is_some());
        assert!(json["storage"].get("database").is_none());
    }
}
