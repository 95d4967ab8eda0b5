//! `deepeyes analyze`: run one instance to completion in-process.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use deepeyes_core::InstanceStatus;
use deepeyes_ingest::UploadEvent;
use deepeyes_runtime::StartOutcome;
use deepeyes_workflow::AnalysisOutput;

use crate::services::Services;
use crate::terminal_output::{note_error, note_info, note_success};

/// Build the upload event for a CLI argument: `http(s)://` is a URL, anything
/// else a local file.
pub async fn event_for(target: &str) -> Result<UploadEvent> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(UploadEvent::from_url(target, None, None));
    }
    let path = Path::new(target);
    if !path.is_file() {
        bail!("No such image file: {target}");
    }
    UploadEvent::from_path(path)
        .await
        .with_context(|| format!("Failed to read file metadata: {target}"))
}

pub async fn run(services: &Services, target: &str) -> Result<()> {
    let event = event_for(target).await?;
    let submission = services.trigger.submit(event).await?;
    let id = submission.instance_id;

    match submission.outcome {
        StartOutcome::Started => note_info(&format!("Analysing {target} (instance {id})")),
        StartOutcome::AlreadyStarted(status) if status.is_terminal() => {
            note_info(&format!("{target} was already analysed (instance {id}, {status})"));
        }
        StartOutcome::AlreadyStarted(status) => {
            // Left unfinished by an earlier process; pick it up from its checkpoints.
            note_info(&format!("Resuming instance {id} ({status})"));
            services.orchestrator.resume_unfinished().await?;
        }
    }

    let record = services
        .orchestrator
        .wait(id)
        .await?
        .with_context(|| format!("Instance {id} disappeared"))?;
    info!(instance_id = %id, status = %record.status, "Analysis finished");

    match record.status {
        InstanceStatus::Completed => {
            let output: AnalysisOutput = record
                .output
                .context("Completed instance has no output")
                .and_then(|v| serde_json::from_value(v).context("Unreadable instance output"))?;
            let result = services
                .results
                .get(&output.result_id)
                .await?
                .with_context(|| format!("Result {} not found", output.result_id))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            note_success(&format!(
                "OCR {} with {} line(s)",
                output.ocr_state, output.line_count
            ));
            Ok(())
        }
        InstanceStatus::Failed(kind) => {
            note_error(&format!(
                "Instance {id} failed ({kind}): {}",
                record.error.as_deref().unwrap_or("no details")
            ));
            bail!("analysis failed");
        }
        other => bail!("Instance {id} stopped while {other}; rerun to resume"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepeyes_core::ImageSource;

    #[tokio::test]
    async fn urls_and_files_map_to_events() {
        let event = event_for("https://img.example/a/receipt.jpg").await.unwrap();
        assert_eq!(event.image.name, "receipt.jpg");
        assert_eq!(event.key, "https://img.example/a/receipt.jpg");

        let missing = event_for("/definitely/not/here.png").await;
        assert!(missing.is_err());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scan.png");
        std::fs::write(&file, b"png").unwrap();
        let event = event_for(file.to_str().unwrap()).await.unwrap();
        assert!(matches!(event.image.source, ImageSource::File { .. }));
        assert!(event.key.starts_with("scan.png:3:"));
    }
}
