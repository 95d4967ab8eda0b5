//! Durable execution context handed to a running workflow.
//!
//! Every side-effecting call goes through `run_step`, which addresses steps by
//! sequence number. A step found in the loaded history is replayed from its
//! recorded output instead of being executed again, so re-running a workflow
//! from the top after a crash repeats no provider call that already
//! completed.
//!
//! A step only starts after the lease has been renewed, and the lease is kept
//! alive on a heartbeat for as long as the step runs. A step whose lease is
//! taken over mid-flight is dropped and fails with `LeaseLost`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use deepeyes_core::{CheckpointStore, DeepEyesError, Event, EventKind, StepRecord};

use crate::retry::{retry_transient, RetryPolicy};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Lease and persistence settings shared by every context of an orchestrator.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub owner: String,
    pub lease_ttl: Duration,
    pub checkpoint_retry: RetryPolicy,
}

pub struct DurableContext {
    instance_id: Uuid,
    store: Arc<dyn CheckpointStore>,
    settings: ContextSettings,
    history: BTreeMap<u32, StepRecord>,
    next_seq: u32,
    cancel: watch::Receiver<bool>,
    events: broadcast::Sender<Event>,
}

impl DurableContext {
    pub fn new(
        instance_id: Uuid,
        store: Arc<dyn CheckpointStore>,
        settings: ContextSettings,
        history: Vec<StepRecord>,
        cancel: watch::Receiver<bool>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            instance_id,
            store,
            settings,
            history: history.into_iter().map(|s| (s.seq, s)).collect(),
            next_seq: 1,
            cancel,
            events,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// True while the context is still walking recorded history.
    pub fn is_replaying(&self) -> bool {
        self.history.contains_key(&self.next_seq)
    }

    /// Execute `f` once and checkpoint its output, or replay the recorded output.
    pub async fn run_step<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T, DeepEyesError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DeepEyesError>>,
    {
        if let Some(value) = self.replay(name)? {
            return Ok(value);
        }
        let value = self.hold_lease(name, f()).await?;
        self.commit(name, &value).await?;
        Ok(value)
    }

    /// Like `run_step`, retrying transient failures of `f` with backoff.
    /// Failed attempts are not checkpointed.
    pub async fn run_step_with_retry<T, F, Fut>(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
        mut f: F,
    ) -> Result<T, DeepEyesError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeepEyesError>>,
    {
        if let Some(value) = self.replay(name)? {
            return Ok(value);
        }
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        let instance_id = self.instance_id;
        let attempts = retry_transient(
            policy,
            name,
            || {
                let attempt = if *cancel.borrow() { None } else { Some(f()) };
                async move {
                    match attempt {
                        Some(fut) => fut.await,
                        None => Err(DeepEyesError::Cancelled),
                    }
                }
            },
            |attempt, err| {
                let _ = events.send(Event::new(
                    instance_id,
                    EventKind::StepRetried,
                    serde_json::json!({
                        "step": name,
                        "attempt": attempt,
                        "error": err.to_string(),
                    }),
                ));
            },
        );
        let value = self.hold_lease(name, attempts).await?;
        self.commit(name, &value).await?;
        Ok(value)
    }

    /// Durable timer. The wake-up instant is checkpointed, so a replay after
    /// the deadline returns at once. Cancellation interrupts the wait.
    pub async fn sleep(&mut self, name: &str, duration: Duration) -> Result<(), DeepEyesError> {
        let replaying = self.is_replaying();
        let wake_at: DateTime<Utc> = self
            .run_step(name, || async move {
                chrono::Duration::from_std(duration)
                    .map(|delta| Utc::now() + delta)
                    .map_err(|e| DeepEyesError::Other(e.into()))
            })
            .await?;
        if !replaying {
            self.emit(
                EventKind::TimerScheduled,
                serde_json::json!({ "step": name, "wakeAt": wake_at }),
            );
        }

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Ok(());
        }
        debug!(
            instance_id = %self.instance_id,
            step = %name,
            remaining_ms = remaining.as_millis() as u64,
            "Suspending on durable timer"
        );

        let mut cancel = self.cancel.clone();
        self.hold_lease(name, async {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => Ok(()),
                _ = wait_for_cancel(&mut cancel) => Err(DeepEyesError::Cancelled),
            }
        })
        .await
    }

    /// Wall-clock time captured as a step, stable across replays.
    pub async fn now(&mut self, name: &str) -> Result<DateTime<Utc>, DeepEyesError> {
        self.run_step(name, || async { Ok(Utc::now()) }).await
    }

    /// Fail with `Cancelled` if a cancel was signalled live or persisted.
    pub async fn check_cancelled(&mut self) -> Result<(), DeepEyesError> {
        let signalled = *self.cancel.borrow();
        if signalled || self.store.is_cancel_requested(self.instance_id).await? {
            info!(instance_id = %self.instance_id, "Cancellation observed");
            return Err(DeepEyesError::Cancelled);
        }
        Ok(())
    }

    async fn renew_lease(&self) -> Result<(), DeepEyesError> {
        self.store
            .renew_lease(self.instance_id, &self.settings.owner, self.settings.lease_ttl)
            .await
    }

    /// Run `work` under the lease: renew it before the first poll, then every
    /// third of the TTL until `work` resolves. Store hiccups are retried on the
    /// next beat; a lost lease drops `work`.
    async fn hold_lease<T, Fut>(&self, name: &str, work: Fut) -> Result<T, DeepEyesError>
    where
        Fut: Future<Output = Result<T, DeepEyesError>>,
    {
        self.renew_lease().await?;

        let period = (self.settings.lease_ttl / 3).max(MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => match self.renew_lease().await {
                    Ok(()) => {}
                    Err(e @ DeepEyesError::LeaseLost(_)) => {
                        warn!(instance_id = %self.instance_id, step = %name, "Lease taken over, abandoning step");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(instance_id = %self.instance_id, step = %name, error = %e, "Lease heartbeat failed");
                    }
                },
            }
        }
    }

    fn replay<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>, DeepEyesError> {
        let seq = self.next_seq;
        let Some(recorded) = self.history.get(&seq) else {
            return Ok(None);
        };
        if recorded.name != name {
            return Err(DeepEyesError::ReplayDeterminismViolation {
                instance_id: self.instance_id,
                seq,
                recorded: recorded.name.clone(),
                requested: name.to_string(),
            });
        }
        let value = serde_json::from_value(recorded.output.clone())?;
        self.next_seq += 1;
        debug!(instance_id = %self.instance_id, seq, step = %name, "Replayed step");
        self.emit(
            EventKind::StepReplayed,
            serde_json::json!({ "seq": seq, "step": name }),
        );
        Ok(Some(value))
    }

    /// Persist a step output, re-saving with backoff on store write failures.
    /// The step only counts as completed once the write went through.
    async fn commit<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), DeepEyesError> {
        let seq = self.next_seq;
        let step = StepRecord::new(seq, name, serde_json::to_value(value)?);

        let store = &self.store;
        let settings = &self.settings;
        let instance_id = self.instance_id;
        let step_ref = &step;
        retry_transient(
            &settings.checkpoint_retry,
            "checkpoint",
            move || store.append_step(instance_id, &settings.owner, step_ref, settings.lease_ttl),
            |_, _| {},
        )
        .await?;

        self.next_seq += 1;
        debug!(instance_id = %self.instance_id, seq, step = %name, "Checkpointed step");
        self.emit(
            EventKind::StepCompleted,
            serde_json::json!({ "seq": seq, "step": name }),
        );
        self.history.insert(seq, step);
        Ok(())
    }

    fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        let _ = self.events.send(Event::new(self.instance_id, kind, payload));
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
