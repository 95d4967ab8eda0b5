//! Orchestrator: starts, resumes, cancels and tracks durable workflow instances.
//!
//! Each active instance runs on its own tokio task. An instance is executed
//! only while this process holds its lease; an in-process registry keeps a
//! second task from being spawned for an instance that is already running.
//! An instance interrupted by a store outage stays registered and is driven
//! again after a backoff, so it does not wait for a restart to make progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use deepeyes_core::{
    CheckpointStore, DeepEyesError, Event, EventKind, InstanceRecord, InstanceStatus,
};

use crate::context::{ContextSettings, DurableContext};
use crate::retry::RetryPolicy;
use crate::workflow::Workflow;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lease owner id of this process.
    pub owner_id: String,
    pub lease_ttl: Duration,
    pub checkpoint_retry: RetryPolicy,
    /// Backoff for re-driving an interrupted instance in this process.
    /// `None` leaves it to the next resume sweep or process.
    pub redrive: Option<RetryPolicy>,
    /// Drop the step history of instances once they are terminal.
    pub prune_completed_steps: bool,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("deepeyes-{}", Uuid::new_v4()),
            lease_ttl: Duration::from_secs(150),
            checkpoint_retry: RetryPolicy::checkpoint(),
            redrive: Some(RetryPolicy::redrive()),
            prune_completed_steps: true,
            event_capacity: 1024,
        }
    }
}

/// Result of `Orchestrator::start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// The instance id already exists; nothing was re-run.
    AlreadyStarted(InstanceStatus),
}

/// How a single pass over an instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    Finished,
    Interrupted,
    /// Another executor holds the lease, or the instance is gone.
    Skipped,
}

struct RunningInstance {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner<W: Workflow> {
    workflow: W,
    store: Arc<dyn CheckpointStore>,
    config: OrchestratorConfig,
    events: broadcast::Sender<Event>,
    running: Mutex<HashMap<Uuid, RunningInstance>>,
    closed: AtomicBool,
}

pub struct Orchestrator<W: Workflow> {
    inner: Arc<Inner<W>>,
}

impl<W: Workflow> Clone for Orchestrator<W> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<W: Workflow> Orchestrator<W> {
    pub fn new(workflow: W, store: Arc<dyn CheckpointStore>, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        info!(
            workflow = %workflow.name(),
            owner = %config.owner_id,
            lease_ttl_secs = config.lease_ttl.as_secs(),
            "Orchestrator created"
        );
        Self {
            inner: Arc::new(Inner {
                workflow,
                store,
                config,
                events,
                running: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.config.owner_id
    }

    /// Create and run a new instance. An existing id is reported, never re-run.
    pub async fn start(&self, id: Uuid, input: W::Input) -> Result<StartOutcome, DeepEyesError> {
        let input = serde_json::to_value(&input)?;
        let record = InstanceRecord::new(id, self.inner.workflow.name(), input.clone());
        if !self.inner.store.create_instance(&record).await? {
            let status = self
                .inner
                .store
                .get_instance(id)
                .await?
                .map(|r| r.status)
                .unwrap_or(InstanceStatus::Pending);
            info!(instance_id = %id, status = %status, "Instance already started, ignoring");
            return Ok(StartOutcome::AlreadyStarted(status));
        }

        info!(instance_id = %id, workflow = %self.inner.workflow.name(), "Instance started");
        self.inner.emit(id, EventKind::InstanceStarted, serde_json::json!({ "input": input }));
        self.spawn(id).await;
        Ok(StartOutcome::Started)
    }

    /// Pick up every non-terminal instance, typically at process start.
    /// Returns the number of instances spawned.
    pub async fn resume_unfinished(&self) -> Result<usize, DeepEyesError> {
        let unfinished = self.inner.store.list_unfinished().await?;
        let mut spawned = 0;
        for record in unfinished {
            if record.workflow != self.inner.workflow.name() {
                debug!(instance_id = %record.id, workflow = %record.workflow, "Skipping foreign workflow");
                continue;
            }
            if self.spawn(record.id).await {
                spawned += 1;
            }
        }
        if spawned > 0 {
            info!(count = spawned, "Resumed unfinished instances");
        }
        Ok(spawned)
    }

    /// Persist a cancel request and wake the instance if it runs here.
    /// Returns `false` for unknown or already terminal instances.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, DeepEyesError> {
        if !self.inner.store.request_cancel(id).await? {
            return Ok(false);
        }
        info!(instance_id = %id, "Cancel requested");
        self.inner.emit(id, EventKind::CancelRequested, serde_json::json!({}));

        let signalled = {
            let running = self.inner.running.lock().await;
            match running.get(&id) {
                Some(instance) => {
                    let _ = instance.cancel.send(true);
                    true
                }
                None => false,
            }
        };
        if !signalled {
            // Not executing here; run it so the flag is turned into a terminal status.
            self.spawn(id).await;
        }
        Ok(true)
    }

    pub async fn status(&self, id: Uuid) -> Result<Option<InstanceRecord>, DeepEyesError> {
        self.inner.store.get_instance(id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<InstanceRecord>, DeepEyesError> {
        self.inner.store.list_instances(limit).await
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.inner.running.lock().await.contains_key(&id)
    }

    /// Wait until this process is no longer executing `id`, then return its record.
    pub async fn wait(&self, id: Uuid) -> Result<Option<InstanceRecord>, DeepEyesError> {
        while self.is_running(id).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.status(id).await
    }

    /// Stop every running instance without finishing it. Leases are released
    /// so the next process resumes from the last checkpoint.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(Uuid, RunningInstance)> =
            self.inner.running.lock().await.drain().collect();
        let count = drained.len();

        for (id, instance) in drained {
            instance.handle.abort();
            let _ = instance.handle.await;
            if let Err(e) = self
                .inner
                .store
                .release_lease(id, &self.inner.config.owner_id)
                .await
            {
                warn!(instance_id = %id, error = %e, "Failed to release lease on shutdown");
            }
            self.inner.emit(
                id,
                EventKind::InstanceInterrupted,
                serde_json::json!({ "reason": "shutdown" }),
            );
        }
        info!(interrupted = count, "Orchestrator stopped");
    }

    /// Spawn an execution task unless one is already registered.
    async fn spawn(&self, id: Uuid) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!(instance_id = %id, "Orchestrator is shut down, not spawning");
            return false;
        }
        let mut running = self.inner.running.lock().await;
        if running.contains_key(&id) {
            debug!(instance_id = %id, "Instance already executing in this process");
            return false;
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut wake = cancel_rx.clone();
            let mut interruptions = 0;
            loop {
                let interrupted = match inner.drive(id, cancel_rx.clone()).await {
                    Ok(outcome) => outcome == Drive::Interrupted,
                    Err(e) if e.is_resumable() => {
                        warn!(instance_id = %id, error = %e, "Instance execution interrupted");
                        true
                    }
                    Err(e) => {
                        error!(instance_id = %id, error = %e, "Instance execution aborted");
                        false
                    }
                };
                if !interrupted || inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                interruptions += 1;
                let Some(delay) = inner.redrive_delay(interruptions) else {
                    warn!(instance_id = %id, interruptions, "Giving up on re-driving instance");
                    break;
                };
                debug!(
                    instance_id = %id,
                    interruptions,
                    delay_ms = delay.as_millis() as u64,
                    "Re-driving interrupted instance"
                );
                // A cancel request cuts the backoff short; the next pass records it.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.changed() => {}
                }
            }
            inner.running.lock().await.remove(&id);
        });
        running.insert(id, RunningInstance { cancel: cancel_tx, handle });
        true
    }
}

impl<W: Workflow> Inner<W> {
    async fn drive(&self, id: Uuid, cancel: watch::Receiver<bool>) -> Result<Drive, DeepEyesError> {
        let owner = &self.config.owner_id;
        if !self
            .store
            .try_acquire_lease(id, owner, self.config.lease_ttl)
            .await?
        {
            debug!(instance_id = %id, "Lease held by another executor, skipping");
            return Ok(Drive::Skipped);
        }
        let Some(record) = self.store.get_instance(id).await? else {
            warn!(instance_id = %id, "Instance vanished after lease acquisition");
            return Ok(Drive::Skipped);
        };
        if record.cancel_requested {
            return self.conclude(id, Err(DeepEyesError::Cancelled)).await;
        }

        let history = self.store.load_steps(id).await?;
        if !history.is_empty() {
            info!(instance_id = %id, steps = history.len(), "Resuming instance from checkpoints");
            self.emit(
                id,
                EventKind::InstanceResumed,
                serde_json::json!({ "checkpoints": history.len() }),
            );
        }

        let input: W::Input = match serde_json::from_value(record.input) {
            Ok(input) => input,
            Err(e) => return self.conclude(id, Err(e.into())).await,
        };

        let settings = ContextSettings {
            owner: owner.clone(),
            lease_ttl: self.config.lease_ttl,
            checkpoint_retry: self.config.checkpoint_retry.clone(),
        };
        let mut ctx = DurableContext::new(
            id,
            self.store.clone(),
            settings,
            history,
            cancel,
            self.events.clone(),
        );
        let result = self
            .workflow
            .run(&mut ctx, input)
            .await
            .and_then(|output| serde_json::to_value(output).map_err(DeepEyesError::from));
        self.conclude(id, result).await
    }

    /// Map the workflow result onto a terminal status, or leave the instance
    /// resumable.
    async fn conclude(
        &self,
        id: Uuid,
        result: Result<serde_json::Value, DeepEyesError>,
    ) -> Result<Drive, DeepEyesError> {
        let owner = &self.config.owner_id;
        match result {
            Ok(output) => {
                self.store
                    .finish(id, owner, InstanceStatus::Completed, Some(output.clone()), None)
                    .await?;
                info!(instance_id = %id, "Instance completed");
                self.emit(id, EventKind::InstanceCompleted, serde_json::json!({ "output": output }));
            }
            Err(e) if e.is_resumable() => {
                warn!(
                    instance_id = %id,
                    error = %e,
                    "Instance interrupted, will resume from last checkpoint"
                );
                if let Err(release_err) = self.store.release_lease(id, owner).await {
                    warn!(instance_id = %id, error = %release_err, "Failed to release lease");
                }
                self.emit(
                    id,
                    EventKind::InstanceInterrupted,
                    serde_json::json!({ "error": e.to_string() }),
                );
                return Ok(Drive::Interrupted);
            }
            Err(e) => {
                let kind = e.failure_kind();
                self.store
                    .finish(id, owner, InstanceStatus::Failed(kind), None, Some(e.to_string()))
                    .await?;
                warn!(instance_id = %id, kind = %kind, error = %e, "Instance failed");
                self.emit(
                    id,
                    EventKind::InstanceFailed,
                    serde_json::json!({ "kind": kind, "error": e.to_string() }),
                );
            }
        }

        if self.config.prune_completed_steps {
            let pruned = self.store.prune_steps(id).await?;
            debug!(instance_id = %id, pruned, "Pruned step history");
        }
        Ok(Drive::Finished)
    }

    /// Backoff before re-drive number `n` (1-indexed), `None` once exhausted.
    fn redrive_delay(&self, n: u32) -> Option<Duration> {
        let policy = self.config.redrive.as_ref()?;
        policy.should_retry(n).then(|| policy.delay_for(n))
    }

    fn emit(&self, id: Uuid, kind: EventKind, payload: serde_json::Value) {
        let _ = self.events.send(Event::new(id, kind, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use deepeyes_core::{FailureKind, StepRecord};
    use deepeyes_store::SqliteCheckpointStore;

    #[derive(Default)]
    struct Counters {
        one: AtomicUsize,
        two: AtomicUsize,
        three: AtomicUsize,
    }

    struct Steps {
        counters: Arc<Counters>,
        nap: Option<Duration>,
        /// Time spent inside step two before it returns.
        slow: Option<Duration>,
        reject: bool,
    }

    impl Steps {
        fn new(counters: Arc<Counters>) -> Self {
            Self { counters, nap: None, slow: None, reject: false }
        }
    }

    #[async_trait]
    impl Workflow for Steps {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &str {
            "steps"
        }

        async fn run(&self, ctx: &mut DurableContext, input: u32) -> Result<u32, DeepEyesError> {
            let a: u32 = ctx
                .run_step("one", || async {
                    self.counters.one.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await?;
            if let Some(nap) = self.nap {
                ctx.sleep("nap", nap).await?;
            }
            let b: u32 = ctx
                .run_step("two", || async {
                    self.counters.two.fetch_add(1, Ordering::SeqCst);
                    if let Some(slow) = self.slow {
                        tokio::time::sleep(slow).await;
                    }
                    if self.reject {
                        return Err(DeepEyesError::permanent("fake", "rejected"));
                    }
                    Ok(2)
                })
                .await?;
            let c: u32 = ctx
                .run_step("three", || async {
                    self.counters.three.fetch_add(1, Ordering::SeqCst);
                    Ok(3)
                })
                .await?;
            Ok(input + a + b + c)
        }
    }

    /// Checkpoint store that starts failing step writes after `fail_after` appends.
    struct FlakyStore {
        inner: SqliteCheckpointStore,
        appends: AtomicUsize,
        fail_after: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_after: usize) -> Self {
            Self {
                inner: SqliteCheckpointStore::in_memory().unwrap(),
                appends: AtomicUsize::new(0),
                fail_after: AtomicUsize::new(fail_after),
            }
        }

        fn heal(&self) {
            self.fail_after.store(usize::MAX, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn create_instance(&self, record: &InstanceRecord) -> Result<bool, DeepEyesError> {
            self.inner.create_instance(record).await
        }
        async fn get_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>, DeepEyesError> {
            self.inner.get_instance(id).await
        }
        async fn list_instances(&self, limit: usize) -> Result<Vec<InstanceRecord>, DeepEyesError> {
            self.inner.list_instances(limit).await
        }
        async fn list_unfinished(&self) -> Result<Vec<InstanceRecord>, DeepEyesError> {
            self.inner.list_unfinished().await
        }
        async fn try_acquire_lease(
            &self,
            id: Uuid,
            owner: &str,
            ttl: Duration,
        ) -> Result<bool, DeepEyesError> {
            self.inner.try_acquire_lease(id, owner, ttl).await
        }
        async fn renew_lease(
            &self,
            id: Uuid,
            owner: &str,
            ttl: Duration,
        ) -> Result<(), DeepEyesError> {
            self.inner.renew_lease(id, owner, ttl).await
        }
        async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), DeepEyesError> {
            self.inner.release_lease(id, owner).await
        }
        async fn load_steps(&self, id: Uuid) -> Result<Vec<StepRecord>, DeepEyesError> {
            self.inner.load_steps(id).await
        }
        async fn append_step(
            &self,
            id: Uuid,
            owner: &str,
            step: &StepRecord,
            ttl: Duration,
        ) -> Result<(), DeepEyesError> {
            if self.appends.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst) {
                return Err(DeepEyesError::StoreWrite("injected write failure".into()));
            }
            self.inner.append_step(id, owner, step, ttl).await?;
            self.appends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn finish(
            &self,
            id: Uuid,
            owner: &str,
            status: InstanceStatus,
            output: Option<serde_json::Value>,
            error: Option<String>,
        ) -> Result<(), DeepEyesError> {
            self.inner.finish(id, owner, status, output, error).await
        }
        async fn request_cancel(&self, id: Uuid) -> Result<bool, DeepEyesError> {
            self.inner.request_cancel(id).await
        }
        async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, DeepEyesError> {
            self.inner.is_cancel_requested(id).await
        }
        async fn prune_steps(&self, id: Uuid) -> Result<usize, DeepEyesError> {
            self.inner.prune_steps(id).await
        }
    }

    fn config(owner: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            owner_id: owner.to_string(),
            lease_ttl: Duration::from_secs(30),
            checkpoint_retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                jitter: false,
                ..Default::default()
            },
            redrive: None,
            prune_completed_steps: true,
            event_capacity: 256,
        }
    }

    fn redriving(owner: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            redrive: Some(RetryPolicy {
                max_attempts: 200,
                base_delay_ms: 10,
                backoff_factor: 1.0,
                jitter: false,
                ..Default::default()
            }),
            ..config(owner)
        }
    }

    fn memory_store() -> Arc<dyn CheckpointStore> {
        Arc::new(SqliteCheckpointStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn runs_to_completion_once() {
        let counters = Arc::new(Counters::default());
        let orch = Orchestrator::new(Steps::new(counters.clone()), memory_store(), config("a"));
        let id = Uuid::new_v4();

        assert_eq!(orch.start(id, 10).await.unwrap(), StartOutcome::Started);
        let record = orch.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.output, Some(serde_json::json!(16)));

        let again = orch.start(id, 10).await.unwrap();
        assert_eq!(again, StartOutcome::AlreadyStarted(InstanceStatus::Completed));
        orch.wait(id).await.unwrap();
        assert_eq!(counters.one.load(Ordering::SeqCst), 1);
        assert_eq!(counters.three.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_failure_leaves_instance_resumable() {
        let store = Arc::new(FlakyStore::new(1));
        let counters = Arc::new(Counters::default());
        let first = Orchestrator::new(Steps::new(counters.clone()), store.clone(), config("node-a"));
        let id = Uuid::new_v4();

        first.start(id, 0).await.unwrap();
        let record = first.wait(id).await.unwrap().unwrap();
        assert!(!record.status.is_terminal());
        assert_eq!(store.load_steps(id).await.unwrap().len(), 1);

        store.heal();
        let second = Orchestrator::new(Steps::new(counters.clone()), store.clone(), config("node-b"));
        assert_eq!(second.resume_unfinished().await.unwrap(), 1);
        let record = second.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.output, Some(serde_json::json!(6)));

        // The checkpointed step never ran twice; the one whose write failed did.
        assert_eq!(counters.one.load(Ordering::SeqCst), 1);
        assert_eq!(counters.two.load(Ordering::SeqCst), 2);
        assert_eq!(counters.three.load(Ordering::SeqCst), 1);
        assert!(store.load_steps(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_error_fails_instance() {
        let counters = Arc::new(Counters::default());
        let mut workflow = Steps::new(counters.clone());
        workflow.reject = true;
        let store = memory_store();
        let orch = Orchestrator::new(workflow, store.clone(), config("a"));
        let id = Uuid::new_v4();
        let mut events = orch.subscribe();

        orch.start(id, 0).await.unwrap();
        let record = orch.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Failed(FailureKind::ProviderRejected));
        assert!(record.error.unwrap().contains("rejected"));
        assert_eq!(counters.three.load(Ordering::SeqCst), 0);
        assert!(store.load_steps(id).await.unwrap().is_empty());

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&EventKind::InstanceStarted));
        assert_eq!(kinds.last(), Some(&EventKind::InstanceFailed));
    }

    #[tokio::test]
    async fn cancel_interrupts_suspended_instance() {
        let counters = Arc::new(Counters::default());
        let mut workflow = Steps::new(counters.clone());
        workflow.nap = Some(Duration::from_secs(3600));
        let orch = Orchestrator::new(workflow, memory_store(), config("a"));
        let id = Uuid::new_v4();

        orch.start(id, 0).await.unwrap();
        assert!(orch.cancel(id).await.unwrap());
        let record = orch.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Failed(FailureKind::Cancelled));
        assert_eq!(counters.two.load(Ordering::SeqCst), 0);

        assert!(!orch.cancel(id).await.unwrap());
        assert!(!orch.cancel(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_keeps_instance_resumable() {
        let counters = Arc::new(Counters::default());
        let mut workflow = Steps::new(counters.clone());
        workflow.nap = Some(Duration::from_millis(300));
        let store = memory_store();
        let orch = Orchestrator::new(workflow, store.clone(), config("a"));
        let id = Uuid::new_v4();

        orch.start(id, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.shutdown().await;
        let record = orch.status(id).await.unwrap().unwrap();
        assert!(!record.status.is_terminal());
        assert!(record.lease_owner.is_none());

        let mut workflow = Steps::new(counters.clone());
        workflow.nap = Some(Duration::from_millis(300));
        let next = Orchestrator::new(workflow, store, config("b"));
        assert_eq!(next.resume_unfinished().await.unwrap(), 1);
        let record = next.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(counters.one.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resume_does_not_double_spawn() {
        let counters = Arc::new(Counters::default());
        let mut workflow = Steps::new(counters.clone());
        workflow.nap = Some(Duration::from_millis(200));
        let store = memory_store();
        store
            .create_instance(&InstanceRecord::new(Uuid::new_v4(), "steps", serde_json::json!(1)))
            .await
            .unwrap();
        let orch = Orchestrator::new(workflow, store, config("a"));

        assert_eq!(orch.resume_unfinished().await.unwrap(), 1);
        assert_eq!(orch.resume_unfinished().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn interrupted_instance_recovers_in_process() {
        let store = Arc::new(FlakyStore::new(1));
        let counters = Arc::new(Counters::default());
        let orch = Orchestrator::new(Steps::new(counters.clone()), store.clone(), redriving("a"));
        let id = Uuid::new_v4();
        let mut events = orch.subscribe();

        orch.start(id, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(orch.is_running(id).await, "still owned while the store is down");
        store.heal();

        let record = orch.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.output, Some(serde_json::json!(6)));
        assert_eq!(counters.one.load(Ordering::SeqCst), 1);
        assert!(counters.two.load(Ordering::SeqCst) >= 2);
        assert_eq!(counters.three.load(Ordering::SeqCst), 1);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::InstanceInterrupted));
        assert_eq!(kinds.last(), Some(&EventKind::InstanceCompleted));
    }

    #[tokio::test]
    async fn slow_step_keeps_second_node_out() {
        let store = memory_store();
        let counters = Arc::new(Counters::default());
        let short_lease = |owner: &str| OrchestratorConfig {
            lease_ttl: Duration::from_millis(150),
            ..config(owner)
        };
        let mut slow = Steps::new(counters.clone());
        slow.slow = Some(Duration::from_millis(400));
        let a = Orchestrator::new(slow, store.clone(), short_lease("node-a"));
        let mut slow = Steps::new(counters.clone());
        slow.slow = Some(Duration::from_millis(400));
        let b = Orchestrator::new(slow, store.clone(), short_lease("node-b"));
        let id = Uuid::new_v4();

        a.start(id, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(b.resume_unfinished().await.unwrap(), 1);
        b.wait(id).await.unwrap();

        let record = a.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(counters.two.load(Ordering::SeqCst), 1);
        assert_eq!(counters.three.load(Ordering::SeqCst), 1);
    }
}
