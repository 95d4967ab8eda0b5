//! Workflow Event Logger
//!
//! Runtime events (step completions, retries, terminal transitions) written as
//! structured log lines, which the file layer turns into NDJSON.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use deepeyes_core::Event;

use crate::redact::redact_sensitive_data;

#[derive(Debug, Serialize)]
pub struct WorkflowLogEntry {
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub payload: String,
}

impl WorkflowLogEntry {
    pub fn from_event(event: &Event) -> Self {
        Self {
            instance_id: event.instance_id,
            timestamp: event.timestamp,
            kind: event.kind.to_string(),
            // Payloads can carry provider error bodies and image URLs
            payload: redact_sensitive_data(&event.payload.to_string()),
        }
    }
}

pub struct WorkflowEventLogger;

impl WorkflowEventLogger {
    /// Logs a runtime event under the `workflow_events` target.
    pub fn log_event(event: &Event) {
        let entry = WorkflowLogEntry::from_event(event);
        info!(
            target: "workflow_events",
            instance_id = %entry.instance_id,
            kind = %entry.kind,
            payload = %entry.payload,
            "Workflow event"
        );
    }
}
