//! Config validation with field paths in every message.

use thiserror::Error;

use crate::schema::DeepEyesConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// All errors and warnings found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors limited to fields under `prefix` (e.g. `"vision"`).
    pub fn errors_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ConfigValidationError> {
        self.errors.iter().filter(move |e| e.path.starts_with(prefix))
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
///
/// Missing vision credentials are reported as errors; commands that never call
/// the provider may ignore `vision.*` entries.
pub fn validate(config: &DeepEyesConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_server(config, &mut report);
    validate_vision(config, &mut report);
    validate_ingest(config, &mut report);
    validate_workflow(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_server(config: &DeepEyesConfig, report: &mut ValidationReport) {
    let port = config.server.port;
    if port == 0 {
        report.error("server.port", "Port must be > 0");
    } else if port < 1024 && port != 80 && port != 443 {
        report.warn(
            "server.port",
            format!("Port {port} requires elevated privileges; consider using a port >= 1024"),
        );
    }
}

fn validate_vision(config: &DeepEyesConfig, report: &mut ValidationReport) {
    let vision = &config.vision;
    if vision.endpoint.trim().is_empty() {
        report.error("vision.endpoint", "Vision endpoint is required (or set VISION_ENDPOINT)");
    } else if !vision.endpoint.starts_with("https://") {
        report.warn("vision.endpoint", "Endpoint is not https; the API key will travel in clear text");
    }
    if vision.api_key.trim().is_empty() {
        report.error("vision.apiKey", "Vision API key is required (or set VISION_API_KEY)");
    }
    if vision.request_timeout_secs == 0 {
        report.error("vision.requestTimeoutSecs", "requestTimeoutSecs must be >= 1");
    }
}

fn validate_ingest(config: &DeepEyesConfig, report: &mut ValidationReport) {
    if config.ingest.watch_dir.is_some() && config.ingest.scan_interval_ms < 100 {
        report.warn("ingest.scanIntervalMs", "Scan interval below 100ms will busy-poll the directory");
    }
}

fn validate_workflow(config: &DeepEyesConfig, report: &mut ValidationReport) {
    let wf = &config.workflow;
    if wf.retry.max_attempts == 0 {
        report.error("workflow.retry.maxAttempts", "maxAttempts must be >= 1");
    }
    if wf.retry.backoff_factor < 1.0 {
        report.error("workflow.retry.backoffFactor", "backoffFactor must be >= 1.0");
    }
    if wf.poll.max_attempts == 0 {
        report.error("workflow.poll.maxAttempts", "maxAttempts must be >= 1");
    }
    if wf.poll.factor < 1.0 {
        report.error("workflow.poll.factor", "factor must be >= 1.0");
    }
    if wf.poll.initial_delay_ms > wf.poll.max_delay_ms {
        report.warn("workflow.poll.initialDelayMs", "initialDelayMs exceeds maxDelayMs and will be capped");
    }
    if wf.lease_ttl_secs == 0 {
        report.error("workflow.leaseTtlSecs", "leaseTtlSecs must be >= 1");
    } else {
        let longest_step_ms = worst_case_step_ms(config);
        if wf.lease_ttl_secs.saturating_mul(1_000) < longest_step_ms {
            report.error(
                "workflow.leaseTtlSecs",
                format!(
                    "leaseTtlSecs must cover the longest provider step ({}s with every retry); \
                     a shorter lease lets another worker take over mid-step",
                    longest_step_ms.div_ceil(1_000)
                ),
            );
        }
    }
    if wf.resume_sweep_secs > 0 && wf.resume_sweep_secs < 5 {
        report.warn("workflow.resumeSweepSecs", "Resume sweeps under 5s mostly re-read leased instances");
    }
}

/// Every attempt timing out, plus the longest backoff (jitter included)
/// between attempts.
fn worst_case_step_ms(config: &DeepEyesConfig) -> u64 {
    let retry = &config.workflow.retry;
    let attempts = u64::from(retry.max_attempts.max(1));
    let mut total = attempts.saturating_mul(config.vision.request_timeout_secs.saturating_mul(1_000));
    for n in 1..attempts {
        let delay = retry.base_delay_ms as f64 * retry.backoff_factor.powi((n - 1) as i32);
        let delay = delay.min(retry.max_delay_ms as f64);
        let delay = if retry.jitter { delay * 1.25 } else { delay };
        total = total.saturating_add(delay.ceil() as u64);
    }
    total
}

fn validate_logging(config: &DeepEyesConfig, report: &mut ValidationReport) {
    let level = config.logging.level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        report.error(
            "logging.level",
            format!("Unknown log level '{}'. Use one of {}", config.logging.level, LOG_LEVELS.join(", ")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> DeepEyesConfig {
        let mut cfg = DeepEyesConfig::default();
        cfg.vision.endpoint = "https://eyes.example".into();
        cfg.vision.api_key = "secret".into();
        cfg
    }

    #[test]
    fn configured_defaults_are_valid() {
        let report = validate(&configured());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    }

    #[test]
    fn missing_credentials_are_vision_errors() {
        let report = validate(&DeepEyesConfig::default());
        assert_eq!(report.errors_under("vision").count(), 2);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn bad_poll_and_level() {
        let mut cfg = configured();
        cfg.workflow.poll.factor = 0.5;
        cfg.logging.level = "loud".into();
        let report = validate(&cfg);
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["workflow.poll.factor", "logging.level"]);
    }

    #[test]
    fn plain_http_and_fast_sweep_warn() {
        let mut cfg = configured();
        cfg.vision.endpoint = "http://localhost:5000".into();
        cfg.workflow.resume_sweep_secs = 1;
        let report = validate(&cfg);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn lease_shorter_than_retried_step_is_rejected() {
        // 4 x 30s timeouts plus 0.5s + 1s + 2s of backoff, jittered up by 25%.
        assert_eq!(worst_case_step_ms(&configured()), 124_375);

        let mut cfg = configured();
        cfg.workflow.lease_ttl_secs = 60;
        let report = validate(&cfg);
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["workflow.leaseTtlSecs"]);
        assert!(report.errors[0].message.contains("125s"));

        cfg.vision.request_timeout_secs = 10;
        assert!(validate(&cfg).is_valid());
    }
}
