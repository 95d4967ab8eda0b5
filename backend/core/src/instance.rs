use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a workflow instance ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProviderRejected,
    RetriesExhausted,
    OcrJobFailed,
    Timeout,
    Cancelled,
    ReplayViolation,
    InvalidTransition,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ProviderRejected => "provider_rejected",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::OcrJobFailed => "ocr_job_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::ReplayViolation => "replay_violation",
            FailureKind::InvalidTransition => "invalid_transition",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "provider_rejected" => FailureKind::ProviderRejected,
            "retries_exhausted" => FailureKind::RetriesExhausted,
            "ocr_job_failed" => FailureKind::OcrJobFailed,
            "timeout" => FailureKind::Timeout,
            "cancelled" => FailureKind::Cancelled,
            "replay_violation" => FailureKind::ReplayViolation,
            "invalid_transition" => FailureKind::InvalidTransition,
            "internal" => FailureKind::Internal,
            other => return Err(format!("unknown failure kind '{other}'")),
        })
    }
}

/// Out-of-band status of a workflow instance, queryable by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed(FailureKind),
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed(_))
    }

    /// Column value for the `status` field; the failure kind is stored separately.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed(_) => "failed",
        }
    }

    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            InstanceStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    /// Rebuild from the stored `(status, failure_kind)` column pair.
    pub fn from_parts(status: &str, kind: Option<&str>) -> Result<Self, String> {
        match status {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => {
                let kind = kind.unwrap_or("internal").parse()?;
                Ok(InstanceStatus::Failed(kind))
            }
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Failed(kind) => write!(f, "failed({kind})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A durable workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: Uuid,
    pub workflow: String,
    pub input: serde_json::Value,
    pub status: InstanceStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(id: Uuid, workflow: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow: workflow.into(),
            input,
            status: InstanceStatus::Pending,
            output: None,
            error: None,
            cancel_requested: false,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One completed, checkpointed step of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub seq: u32,
    pub name: String,
    pub output: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(seq: u32, name: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            seq,
            name: name.into(),
            output,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_columns() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Failed(FailureKind::Timeout),
        ] {
            let kind = status.failure_kind().map(|k| k.as_str());
            assert_eq!(InstanceStatus::from_parts(status.as_str(), kind).unwrap(), status);
        }
    }

    #[test]
    fn status_json_shape() {
        let json = serde_json::to_value(InstanceStatus::Failed(FailureKind::Cancelled)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "kind": "cancelled"}));
        assert_eq!(InstanceStatus::Failed(FailureKind::Timeout).to_string(), "failed(timeout)");
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(InstanceStatus::from_parts("paused", None).is_err());
        assert!(InstanceStatus::from_parts("failed", Some("meteor")).is_err());
    }
}
