use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DeepEyesError;
use crate::instance::{InstanceRecord, InstanceStatus, StepRecord};
use crate::types::{DescriptionResult, ImageRef, JobId, JobStatus, ScanResult};

/// Capability-abstracted client for the vision provider.
#[async_trait]
pub trait VisionAdapter: Send + Sync {
    /// Provider name (e.g., "azure").
    fn name(&self) -> &str;

    /// Tag, caption, face, object, color and adult-content analysis.
    async fn describe(&self, image: &ImageRef) -> Result<DescriptionResult, DeepEyesError>;

    /// Submit an asynchronous text-extraction job. Side-effecting; the
    /// runtime calls it at most once per instance.
    async fn start_text_job(
        &self,
        image: &ImageRef,
        idempotency_key: &str,
    ) -> Result<JobId, DeepEyesError>;

    /// Read the current state of a text-extraction job. Safe to repeat.
    async fn poll_text_job(&self, job: &JobId) -> Result<JobStatus, DeepEyesError>;
}

/// Document store holding the reader-visible ScanResult snapshots.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Atomically replace the whole record keyed by `result.id`.
    async fn upsert(&self, result: &ScanResult) -> Result<(), DeepEyesError>;

    async fn get(&self, id: &str) -> Result<Option<ScanResult>, DeepEyesError>;

    /// All snapshots, most recently updated first.
    async fn list(&self) -> Result<Vec<ScanResult>, DeepEyesError>;
}

/// Persistence for workflow instances and their step checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert a new instance. Returns `false` when the id already exists.
    async fn create_instance(&self, record: &InstanceRecord) -> Result<bool, DeepEyesError>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>, DeepEyesError>;

    /// Most recently updated instances first.
    async fn list_instances(&self, limit: usize) -> Result<Vec<InstanceRecord>, DeepEyesError>;

    /// Instances that have not reached a terminal status.
    async fn list_unfinished(&self) -> Result<Vec<InstanceRecord>, DeepEyesError>;

    /// Take the lease if it is free, expired, or already ours. Marks the
    /// instance running.
    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, DeepEyesError>;

    /// Extend a lease `owner` still holds. Fails with `LeaseLost` once another
    /// executor has taken it over or the instance is terminal.
    async fn renew_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> Result<(), DeepEyesError>;

    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), DeepEyesError>;

    /// Step history ordered by sequence number.
    async fn load_steps(&self, id: Uuid) -> Result<Vec<StepRecord>, DeepEyesError>;

    /// Persist a step result, fenced on lease ownership, renewing the lease.
    async fn append_step(
        &self,
        id: Uuid,
        owner: &str,
        step: &StepRecord,
        ttl: Duration,
    ) -> Result<(), DeepEyesError>;

    /// Record a terminal status and release the lease.
    async fn finish(
        &self,
        id: Uuid,
        owner: &str,
        status: InstanceStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), DeepEyesError>;

    /// Set the persistent cancel flag. Returns `false` for unknown or terminal instances.
    async fn request_cancel(&self, id: Uuid) -> Result<bool, DeepEyesError>;

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, DeepEyesError>;

    /// Drop the step history of a terminal instance.
    async fn prune_steps(&self, id: Uuid) -> Result<usize, DeepEyesError>;
}
