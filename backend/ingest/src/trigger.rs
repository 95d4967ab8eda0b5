//! Ingestion trigger: turns an image arrival into exactly one workflow instance.
//!
//! The instance id is a UUID v5 of the upload event key, so a redelivered
//! event maps onto the instance it already started and is ignored.

use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use deepeyes_core::{DeepEyesError, ImageRef};
use deepeyes_runtime::StartOutcome;
use deepeyes_workflow::{AnalysisInput, AnalysisOrchestrator};

/// Namespace for instance ids derived from upload event keys.
pub const INGEST_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_4c2a_9b7e_4e0f_a3c5_d8e2_1b4f_7a90);

pub fn instance_id_for(event_key: &str) -> Uuid {
    Uuid::new_v5(&INGEST_NAMESPACE, event_key.as_bytes())
}

/// One image arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    /// Delivery-stable identity of the arrival.
    pub key: String,
    pub image: ImageRef,
}

impl UploadEvent {
    /// Upload announced by URL. Without an explicit event id the URL is the key.
    pub fn from_url(url: &str, name: Option<&str>, event_id: Option<&str>) -> Self {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| name_from_url(url));
        Self {
            key: event_id.unwrap_or(url).to_string(),
            image: ImageRef::from_url(name, url),
        }
    }

    /// File found in an upload directory, keyed by `name:size:mtime`.
    pub fn from_file(path: &Path, size: u64, modified_secs: u64) -> Self {
        let image = ImageRef::from_file(path);
        Self {
            key: format!("{}:{}:{}", image.name, size, modified_secs),
            image,
        }
    }

    /// Build from file metadata on disk.
    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Self::from_file(path, meta.len(), modified))
    }

    pub fn instance_id(&self) -> Uuid {
        instance_id_for(&self.key)
    }
}

fn name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| url.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub instance_id: Uuid,
    pub outcome: StartOutcome,
}

impl Submission {
    pub fn is_new(&self) -> bool {
        self.outcome == StartOutcome::Started
    }
}

#[derive(Clone)]
pub struct IngestTrigger {
    orchestrator: AnalysisOrchestrator,
}

impl IngestTrigger {
    pub fn new(orchestrator: AnalysisOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn submit(&self, event: UploadEvent) -> Result<Submission, DeepEyesError> {
        let instance_id = event.instance_id();
        debug!(key = %event.key, instance_id = %instance_id, "Upload event received");
        let outcome = self
            .orchestrator
            .start(instance_id, AnalysisInput { image: event.image.clone() })
            .await?;
        if outcome == StartOutcome::Started {
            info!(image = %event.image, instance_id = %instance_id, "Analysis triggered");
        } else {
            info!(key = %event.key, instance_id = %instance_id, "Duplicate upload event ignored");
        }
        Ok(Submission { instance_id, outcome })
    }
}
