//! Process wiring: stores, the vision client and the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use deepeyes_core::{CheckpointStore, ResultStore, VisionAdapter};
use deepeyes_ingest::IngestTrigger;
use deepeyes_runtime::Orchestrator;
use deepeyes_store::{EventStore, SqliteCheckpointStore, SqliteResultStore};
use deepeyes_vision::AzureVisionClient;
use deepeyes_workflow::{AnalysisOrchestrator, AnalysisWorkflow};

use crate::settings::Settings;

#[derive(Clone)]
pub struct Services {
    pub results: Arc<dyn ResultStore>,
    pub events: Arc<EventStore>,
    pub orchestrator: AnalysisOrchestrator,
    pub trigger: IngestTrigger,
}

impl Services {
    /// Open the database and build the runtime with the provider client from
    /// config. The client is created once and shared by every instance.
    pub fn open(settings: &Settings) -> Result<Self> {
        let vision = AzureVisionClient::new(settings.vision_client_config())
            .context("Failed to configure vision client")?;
        Self::open_with(settings, Arc::new(vision))
    }

    pub fn open_with(settings: &Settings, vision: Arc<dyn VisionAdapter>) -> Result<Self> {
        let db_path = prepare_db_path(settings)?;
        info!(db = %db_path.display(), "Opening stores");

        let results: Arc<dyn ResultStore> = Arc::new(SqliteResultStore::open(&db_path)?);
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&db_path)?);
        let events = Arc::new(EventStore::open(&db_path)?);

        Ok(Self::assemble(settings, vision, results, checkpoints, events))
    }

    pub fn assemble(
        settings: &Settings,
        vision: Arc<dyn VisionAdapter>,
        results: Arc<dyn ResultStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<EventStore>,
    ) -> Self {
        let workflow = AnalysisWorkflow::new(vision, results.clone(), settings.analysis_settings());
        let orchestrator = Orchestrator::new(workflow, checkpoints, settings.orchestrator_config());
        let trigger = IngestTrigger::new(orchestrator.clone());
        Self {
            results,
            events,
            orchestrator,
            trigger,
        }
    }

    /// Open only the read side, for commands that never run workflows.
    pub fn open_readonly(settings: &Settings) -> Result<(Arc<SqliteResultStore>, Arc<SqliteCheckpointStore>)> {
        let db_path = prepare_db_path(settings)?;
        Ok((
            Arc::new(SqliteResultStore::open(&db_path)?),
            Arc::new(SqliteCheckpointStore::open(&db_path)?),
        ))
    }
}

fn prepare_db_path(settings: &Settings) -> Result<PathBuf> {
    let db_path = settings.database_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }
    Ok(db_path)
}
