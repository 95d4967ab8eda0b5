use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use deepeyes_core::{Event, EventKind};
use deepeyes_logging::WorkflowEventLogger;

use crate::events::EventStore;

/// Persists every runtime event and logs the lifecycle ones, so operators can
/// query why an instance stopped.
pub struct EventRecorder {
    store: Arc<EventStore>,
}

impl EventRecorder {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    /// Consume the runtime's event channel until every sender is gone.
    pub async fn run(&self, mut rx: broadcast::Receiver<Event>) -> Result<()> {
        info!("Event recorder started");

        loop {
            match rx.recv().await {
                Ok(event) => self.record(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Event recorder lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("Event channel closed, recorder shutting down");
        Ok(())
    }

    pub async fn record(&self, event: &Event) {
        debug!(
            instance_id = %event.instance_id,
            kind = %event.kind,
            "Recording workflow event"
        );

        if let Err(e) = self.store.insert(event).await {
            error!(error = %e, "Failed to persist event");
        }

        WorkflowEventLogger::log_event(event);

        match &event.kind {
            EventKind::InstanceStarted => {
                info!(instance_id = %event.instance_id, "Instance started");
            }
            EventKind::InstanceResumed => {
                info!(instance_id = %event.instance_id, "Instance resumed");
            }
            EventKind::InstanceCompleted => {
                info!(instance_id = %event.instance_id, "Instance completed");
            }
            EventKind::InstanceFailed => {
                warn!(
                    instance_id = %event.instance_id,
                    payload = %event.payload,
                    "Instance failed"
                );
            }
            EventKind::InstanceInterrupted => {
                warn!(
                    instance_id = %event.instance_id,
                    payload = %event.payload,
                    "Instance interrupted, will resume on next start"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn records_until_channel_closes() {
        let store = Arc::new(EventStore::in_memory().unwrap());
        let recorder = EventRecorder::new(Arc::clone(&store));
        let (tx, rx) = broadcast::channel(16);

        let instance_id = Uuid::new_v4();
        tx.send(Event::new(instance_id, EventKind::InstanceStarted, serde_json::json!({})))
            .unwrap();
        tx.send(Event::new(
            instance_id,
            EventKind::InstanceFailed,
            serde_json::json!({"kind": "timeout"}),
        ))
        .unwrap();
        drop(tx);

        recorder.run(rx).await.unwrap();

        let events = store.get_instance_events(&instance_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::InstanceFailed);
    }
}
