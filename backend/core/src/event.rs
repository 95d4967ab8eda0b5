use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable audit event emitted by the orchestrator runtime.
/// Every step completion, replay, retry and terminal transition is recorded as an Event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Categories of events that can occur during a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new instance was created and started
    InstanceStarted,
    /// An existing instance was picked up again after a restart
    InstanceResumed,
    /// A step ran and its result was checkpointed
    StepCompleted,
    /// A step was answered from its checkpoint
    StepReplayed,
    /// A step failed transiently and will run again
    StepRetried,
    /// A durable timer was armed
    TimerScheduled,
    /// An operator asked for cancellation
    CancelRequested,
    /// The instance completed successfully
    InstanceCompleted,
    /// The instance reached a terminal failure
    InstanceFailed,
    /// Execution stopped without a terminal state; the instance stays resumable
    InstanceInterrupted,
}

impl Event {
    pub fn new(instance_id: Uuid, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let instance_id = Uuid::new_v4();
        let event = Event::new(
            instance_id,
            EventKind::InstanceStarted,
            serde_json::json!({"image": "cat.png"}),
        );
        assert_eq!(event.instance_id, instance_id);
        assert_eq!(event.kind, EventKind::InstanceStarted);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            EventKind::StepCompleted,
            serde_json::json!({"step": "describe"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        let deserialized: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.kind, EventKind::StepCompleted);
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::InstanceStarted.to_string(), "instance_started");
        assert_eq!(EventKind::StepReplayed.to_string(), "step_replayed");
    }
}
