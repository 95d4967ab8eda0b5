//! The image analysis workflow.
//!
//! describe → save.initial → (done when no text) → save.running → ocr.start
//! → ocr.poll.{n} / ocr.wait.{n} … → save.done
//!
//! Every provider call and every result write is a durable step, so a resumed
//! instance re-enters from the top and replays what already happened. The
//! reader-visible record only ever moves PENDING → RUNNING → DONE.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use deepeyes_core::{
    DeepEyesError, ImageRef, JobId, JobStatus, OcrState, ResultStore, ScanResult, TextRegion,
    VisionAdapter,
};
use deepeyes_runtime::{DurableContext, Orchestrator, RetryPolicy, Workflow};

use crate::merge::flatten_lines;
use crate::polling::PollPolicy;

pub const WORKFLOW_NAME: &str = "image-analysis";

pub type AnalysisOrchestrator = Orchestrator<AnalysisWorkflow>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisInput {
    pub image: ImageRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutput {
    pub result_id: String,
    pub ocr_state: OcrState,
    pub line_count: usize,
}

impl AnalysisOutput {
    fn of(result: &ScanResult) -> Self {
        Self {
            result_id: result.id.clone(),
            ocr_state: result.ocr.state,
            line_count: result.ocr.lines.len(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisSettings {
    /// Backoff for transient provider and store failures inside a step.
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

pub struct AnalysisWorkflow {
    vision: Arc<dyn VisionAdapter>,
    results: Arc<dyn ResultStore>,
    settings: AnalysisSettings,
}

impl AnalysisWorkflow {
    pub fn new(
        vision: Arc<dyn VisionAdapter>,
        results: Arc<dyn ResultStore>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            vision,
            results,
            settings,
        }
    }

    /// Upsert the whole record as step `name`. The write time is part of the
    /// step output so replays reproduce the same `updatedAt`.
    async fn save(
        &self,
        ctx: &mut DurableContext,
        name: &str,
        result: &mut ScanResult,
    ) -> Result<(), DeepEyesError> {
        let snapshot: &ScanResult = result;
        let updated_at: DateTime<Utc> = ctx
            .run_step_with_retry(name, &self.settings.retry, || async move {
                let mut record = snapshot.clone();
                record.updated_at = Utc::now();
                self.results.upsert(&record).await?;
                Ok::<_, DeepEyesError>(record.updated_at)
            })
            .await?;
        result.updated_at = updated_at;
        debug!(
            instance_id = %ctx.instance_id(),
            result_id = %result.id,
            ocr_state = %result.ocr.state,
            step = %name,
            "Result snapshot written"
        );
        Ok(())
    }

    /// Poll until the job finishes, sleeping on durable timers in between.
    async fn await_text_job(
        &self,
        ctx: &mut DurableContext,
        job: &JobId,
    ) -> Result<Vec<TextRegion>, DeepEyesError> {
        let mut waits = self.settings.poll.waits();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            ctx.check_cancelled().await?;

            let status: JobStatus = ctx
                .run_step_with_retry(
                    &format!("ocr.poll.{attempt}"),
                    &self.settings.retry,
                    || self.vision.poll_text_job(job),
                )
                .await?;

            match status {
                JobStatus::Done { regions } => {
                    info!(
                        instance_id = %ctx.instance_id(),
                        job_id = %job,
                        polls = attempt,
                        regions = regions.len(),
                        "OCR job finished"
                    );
                    return Ok(regions);
                }
                JobStatus::Failed { reason } => {
                    return Err(DeepEyesError::OcrJobFailed {
                        job_id: job.to_string(),
                        reason,
                    });
                }
                JobStatus::Pending | JobStatus::Running => {}
            }

            let Some(delay) = waits.next() else {
                return Err(DeepEyesError::Timeout(format!(
                    "OCR job {job} unfinished after {attempt} polls"
                )));
            };
            ctx.sleep(&format!("ocr.wait.{attempt}"), delay).await?;
        }
    }
}

#[async_trait]
impl Workflow for AnalysisWorkflow {
    type Input = AnalysisInput;
    type Output = AnalysisOutput;

    fn name(&self) -> &str {
        WORKFLOW_NAME
    }

    async fn run(
        &self,
        ctx: &mut DurableContext,
        input: AnalysisInput,
    ) -> Result<AnalysisOutput, DeepEyesError> {
        let image = &input.image;
        let instance_id = ctx.instance_id();

        let mut result: ScanResult = ctx
            .run_step_with_retry("describe", &self.settings.retry, || async move {
                let description = self.vision.describe(image).await?;
                Ok::<_, DeepEyesError>(ScanResult::from_description(
                    Uuid::new_v4().to_string(),
                    image.name.as_str(),
                    description,
                    Utc::now(),
                ))
            })
            .await?;
        info!(
            instance_id = %instance_id,
            result_id = %result.id,
            image = %image.name,
            tags = result.tags.len(),
            ocr_state = %result.ocr.state,
            "Image described"
        );
        self.save(ctx, "save.initial", &mut result).await?;

        if !result.needs_ocr() {
            info!(instance_id = %instance_id, result_id = %result.id, "No text detected");
            return Ok(AnalysisOutput::of(&result));
        }

        result.ocr.mark_running()?;
        self.save(ctx, "save.running", &mut result).await?;

        let idempotency_key = instance_id.to_string();
        let job: JobId = ctx
            .run_step_with_retry("ocr.start", &self.settings.retry, || {
                self.vision.start_text_job(image, &idempotency_key)
            })
            .await?;
        info!(instance_id = %instance_id, job_id = %job, "OCR job started");

        let regions = self.await_text_job(ctx, &job).await?;
        result.ocr.complete(flatten_lines(&regions))?;
        self.save(ctx, "save.done", &mut result).await?;

        info!(
            instance_id = %instance_id,
            result_id = %result.id,
            lines = result.ocr.lines.len(),
            "Analysis complete"
        );
        Ok(AnalysisOutput::of(&result))
    }
}
