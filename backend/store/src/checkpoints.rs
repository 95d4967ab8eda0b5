//! Durable SQLite storage for workflow instances and step checkpoints.
//!
//! Steps are keyed by `(instance_id, seq)`. Every step insert runs in the same
//! transaction as a lease check, so only the current lease holder can extend
//! an instance's history.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deepeyes_core::{CheckpointStore, DeepEyesError, InstanceRecord, InstanceStatus, StepRecord};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_instances (
        id               TEXT PRIMARY KEY,
        workflow         TEXT NOT NULL,
        input            TEXT NOT NULL,
        status           TEXT NOT NULL,
        failure_kind     TEXT,
        output           TEXT,
        error            TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        lease_owner      TEXT,
        lease_expires_at INTEGER,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status);
    CREATE TABLE IF NOT EXISTS workflow_steps (
        instance_id  TEXT NOT NULL,
        seq          INTEGER NOT NULL,
        name         TEXT NOT NULL,
        output       TEXT NOT NULL,
        completed_at INTEGER NOT NULL,
        PRIMARY KEY (instance_id, seq)
    );";

const INSTANCE_COLUMNS: &str = "id, workflow, input, status, failure_kind, output, error,
     cancel_requested, lease_owner, lease_expires_at, created_at, updated_at";

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint store at the given path.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn =
            Connection::open(path.as_ref()).context("Failed to open checkpoint database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize checkpoint schema")?;
        info!(path = ?path.as_ref(), "Checkpoint store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

/// Raw column values of one `workflow_instances` row.
struct InstanceRow {
    id: String,
    workflow: String,
    input: String,
    status: String,
    failure_kind: Option<String>,
    output: Option<String>,
    error: Option<String>,
    cancel_requested: bool,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow: row.get(1)?,
            input: row.get(2)?,
            status: row.get(3)?,
            failure_kind: row.get(4)?,
            output: row.get(5)?,
            error: row.get(6)?,
            cancel_requested: row.get::<_, i32>(7)? != 0,
            lease_owner: row.get(8)?,
            lease_expires_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Option<InstanceRecord> {
        let status = match InstanceStatus::from_parts(&self.status, self.failure_kind.as_deref()) {
            Ok(status) => status,
            Err(e) => {
                warn!(id = %self.id, error = %e, "Skipping instance with unreadable status");
                return None;
            }
        };
        Some(InstanceRecord {
            id: Uuid::parse_str(&self.id).ok()?,
            workflow: self.workflow,
            input: serde_json::from_str(&self.input).ok()?,
            status,
            output: self.output.and_then(|o| serde_json::from_str(&o).ok()),
            error: self.error,
            cancel_requested: self.cancel_requested,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            created_at: DateTime::<Utc>::from_timestamp_millis(self.created_at)?,
            updated_at: DateTime::<Utc>::from_timestamp_millis(self.updated_at)?,
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms() + ttl.as_millis() as i64
}

fn read_err(e: rusqlite::Error) -> DeepEyesError {
    DeepEyesError::Other(anyhow::Error::new(e).context("checkpoint store read failed"))
}

fn write_err(e: rusqlite::Error) -> DeepEyesError {
    DeepEyesError::StoreWrite(e.to_string())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<bool, DeepEyesError> {
        let input = serde_json::to_string(&record.input)?;
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT INTO workflow_instances
                    (id, workflow, input, status, cancel_requested, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    record.id.to_string(),
                    record.workflow,
                    input,
                    record.status.as_str(),
                    record.created_at.timestamp_millis(),
                    record.updated_at.timestamp_millis(),
                ],
            )
            .map_err(write_err)?;
        Ok(inserted == 1)
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>, DeepEyesError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?1"),
                params![id.to_string()],
                InstanceRow::from_row,
            )
            .optional()
            .map_err(read_err)?;
        Ok(row.and_then(InstanceRow::into_record))
    }

    async fn list_instances(&self, limit: usize) -> Result<Vec<InstanceRecord>, DeepEyesError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 ORDER BY updated_at DESC LIMIT ?1"
            ))
            .map_err(read_err)?;
        let records = stmt
            .query_map(params![limit as i64], InstanceRow::from_row)
            .map_err(read_err)?
            .filter_map(|r| r.ok())
            .filter_map(InstanceRow::into_record)
            .collect();
        Ok(records)
    }

    async fn list_unfinished(&self) -> Result<Vec<InstanceRecord>, DeepEyesError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 WHERE status IN ('pending', 'running')
                 ORDER BY created_at ASC"
            ))
            .map_err(read_err)?;
        let records = stmt
            .query_map([], InstanceRow::from_row)
            .map_err(read_err)?
            .filter_map(|r| r.ok())
            .filter_map(InstanceRow::into_record)
            .collect();
        Ok(records)
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, DeepEyesError> {
        let now = now_ms();
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workflow_instances
                 SET lease_owner = ?2,
                     lease_expires_at = ?3,
                     status = 'running',
                     updated_at = ?4
                 WHERE id = ?1
                   AND status IN ('pending', 'running')
                   AND (lease_owner IS NULL OR lease_owner = ?2 OR lease_expires_at < ?4)",
                params![id.to_string(), owner, expiry_ms(ttl), now],
            )
            .map_err(write_err)?;
        debug!(instance_id = %id, owner = %owner, acquired = changed == 1, "Lease attempt");
        Ok(changed == 1)
    }

    async fn renew_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> Result<(), DeepEyesError> {
        let now = now_ms();
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workflow_instances SET lease_expires_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND lease_owner = ?2 AND status IN ('pending', 'running')",
                params![id.to_string(), owner, expiry_ms(ttl), now],
            )
            .map_err(write_err)?;
        if changed == 0 {
            return Err(DeepEyesError::LeaseLost(id));
        }
        Ok(())
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), DeepEyesError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE workflow_instances SET lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND lease_owner = ?2",
            params![id.to_string(), owner],
        )
        .map_err(write_err)?;
        Ok(())
    }

    async fn load_steps(&self, id: Uuid) -> Result<Vec<StepRecord>, DeepEyesError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT seq, name, output, completed_at FROM workflow_steps
                 WHERE instance_id = ?1 ORDER BY seq ASC",
            )
            .map_err(read_err)?;
        let rows: Vec<(u32, String, String, i64)> = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(read_err)?
            .collect::<Result<_, _>>()
            .map_err(read_err)?;

        rows.into_iter()
            .map(|(seq, name, output, completed_at)| {
                Ok(StepRecord {
                    seq,
                    name,
                    output: serde_json::from_str(&output)?,
                    completed_at: DateTime::<Utc>::from_timestamp_millis(completed_at)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn append_step(
        &self,
        id: Uuid,
        owner: &str,
        step: &StepRecord,
        ttl: Duration,
    ) -> Result<(), DeepEyesError> {
        let output = serde_json::to_string(&step.output)?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(write_err)?;

        let renewed = tx
            .execute(
                "UPDATE workflow_instances SET lease_expires_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND lease_owner = ?2",
                params![id.to_string(), owner, expiry_ms(ttl), now_ms()],
            )
            .map_err(write_err)?;
        if renewed == 0 {
            return Err(DeepEyesError::LeaseLost(id));
        }

        tx.execute(
            "INSERT INTO workflow_steps (instance_id, seq, name, output, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                step.seq,
                step.name,
                output,
                step.completed_at.timestamp_millis(),
            ],
        )
        .map_err(write_err)?;

        tx.commit().map_err(write_err)?;
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
        let output = output.map(|o| serde_json::to_string(&o)).transpose()?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workflow_instances
                 SET status = ?3, failure_kind = ?4, output = ?5, error = ?6,
                     lease_owner = NULL, lease_expires_at = NULL, updated_at = ?7
                 WHERE id = ?1 AND lease_owner = ?2",
                params![
                    id.to_string(),
                    owner,
                    status.as_str(),
                    status.failure_kind().map(|k| k.as_str()),
                    output,
                    error,
                    now_ms(),
                ],
            )
            .map_err(write_err)?;
        if changed == 0 {
            return Err(DeepEyesError::LeaseLost(id));
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, DeepEyesError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workflow_instances SET cancel_requested = 1, updated_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id.to_string(), now_ms()],
            )
            .map_err(write_err)?;
        Ok(changed == 1)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, DeepEyesError> {
        let conn = self.conn.lock().await;
        let flag: Option<i32> = conn
            .query_row(
                "SELECT cancel_requested FROM workflow_instances WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?;
        Ok(flag.unwrap_or(0) != 0)
    }

    async fn prune_steps(&self, id: Uuid) -> Result<usize, DeepEyesError> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "DELETE FROM workflow_steps WHERE instance_id = ?1
                   AND EXISTS (SELECT 1 FROM workflow_instances
                               WHERE id = ?1 AND status IN ('completed', 'failed'))",
                params![id.to_string()],
            )
            .map_err(write_err)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepeyes_core::FailureKind;

    const TTL: Duration = Duration::from_secs(60);

    async fn store_with_instance() -> (SqliteCheckpointStore, Uuid) {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let id = Uuid::new_v4();
        let record = InstanceRecord::new(id, "analyze_image", serde_json::json!({"image": "a.png"}));
        assert!(store.create_instance(&record).await.unwrap());
        (store, id)
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (store, id) = store_with_instance().await;
        let again = InstanceRecord::new(id, "analyze_image", serde_json::json!({}));
        assert!(!store.create_instance(&again).await.unwrap());
        let record = store.get_instance(id).await.unwrap().unwrap();
        assert_eq!(record.input["image"], "a.png");
        assert_eq!(record.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let (store, id) = store_with_instance().await;
        assert!(store.try_acquire_lease(id, "worker-a", TTL).await.unwrap());
        assert!(!store.try_acquire_lease(id, "worker-b", TTL).await.unwrap());
        assert!(store.try_acquire_lease(id, "worker-a", TTL).await.unwrap());

        store.release_lease(id, "worker-a").await.unwrap();
        assert!(store.try_acquire_lease(id, "worker-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (store, id) = store_with_instance().await;
        assert!(store.try_acquire_lease(id, "worker-a", Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.try_acquire_lease(id, "worker-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn renewal_requires_current_ownership() {
        let (store, id) = store_with_instance().await;
        let err = store.renew_lease(id, "worker-a", TTL).await.unwrap_err();
        assert!(matches!(err, DeepEyesError::LeaseLost(_)));

        assert!(store.try_acquire_lease(id, "worker-a", Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Expired but not yet taken: the holder may still extend it.
        store.renew_lease(id, "worker-a", TTL).await.unwrap();
        assert!(!store.try_acquire_lease(id, "worker-b", TTL).await.unwrap());

        store.release_lease(id, "worker-a").await.unwrap();
        assert!(store.try_acquire_lease(id, "worker-b", TTL).await.unwrap());
        let err = store.renew_lease(id, "worker-a", TTL).await.unwrap_err();
        assert!(matches!(err, DeepEyesError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn steps_are_fenced_by_lease() {
        let (store, id) = store_with_instance().await;
        store.try_acquire_lease(id, "worker-a", TTL).await.unwrap();

        let step = StepRecord::new(0, "describe", serde_json::json!({"id": "r1"}));
        store.append_step(id, "worker-a", &step, TTL).await.unwrap();

        let foreign = StepRecord::new(1, "save.initial", serde_json::json!(null));
        let err = store.append_step(id, "worker-b", &foreign, TTL).await.unwrap_err();
        assert!(matches!(err, DeepEyesError::LeaseLost(_)));

        let steps = store.load_steps(id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "describe");
        assert_eq!(steps[0].output["id"], "r1");
    }

    #[tokio::test]
    async fn duplicate_sequence_is_rejected() {
        let (store, id) = store_with_instance().await;
        store.try_acquire_lease(id, "w", TTL).await.unwrap();
        let step = StepRecord::new(0, "describe", serde_json::json!(1));
        store.append_step(id, "w", &step, TTL).await.unwrap();
        let err = store.append_step(id, "w", &step, TTL).await.unwrap_err();
        assert!(matches!(err, DeepEyesError::StoreWrite(_)));
    }

    #[tokio::test]
    async fn finish_records_terminal_status_and_prunes() {
        let (store, id) = store_with_instance().await;
        store.try_acquire_lease(id, "w", TTL).await.unwrap();
        store
            .append_step(id, "w", &StepRecord::new(0, "describe", serde_json::json!(1)), TTL)
            .await
            .unwrap();

        assert_eq!(store.prune_steps(id).await.unwrap(), 0, "running instances keep history");

        store
            .finish(
                id,
                "w",
                InstanceStatus::Failed(FailureKind::Timeout),
                None,
                Some("ocr polling exceeded budget".into()),
            )
            .await
            .unwrap();

        let record = store.get_instance(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Failed(FailureKind::Timeout));
        assert!(record.lease_owner.is_none());
        assert!(store.list_unfinished().await.unwrap().is_empty());
        assert!(!store.try_acquire_lease(id, "w", TTL).await.unwrap());
        assert_eq!(store.prune_steps(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_live_instances() {
        let (store, id) = store_with_instance().await;
        assert!(!store.is_cancel_requested(id).await.unwrap());
        assert!(store.request_cancel(id).await.unwrap());
        assert!(store.is_cancel_requested(id).await.unwrap());
        assert!(!store.request_cancel(Uuid::new_v4()).await.unwrap());
    }
}
