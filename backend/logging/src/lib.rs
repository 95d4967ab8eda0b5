//! Telemetry and structured logging components for DeepEyes.
//!
//! Handles log redaction, console and rolling NDJSON output, and workflow event logging.

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::{WorkflowEventLogger, WorkflowLogEntry};
pub use logger::{init_logger, LogOptions};
pub use redact::redact_sensitive_data;
