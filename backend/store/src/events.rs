use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use deepeyes_core::Event;

/// SQLite-backed append-only log of workflow runtime events.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open or create the event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;
        info!(path = ?path.as_ref(), "Event store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert an event into the store.
    pub async fn insert(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflow_events (id, instance_id, timestamp, kind, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.instance_id.to_string(),
                event.timestamp.timestamp_micros(),
                event.kind.to_string(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Query events for a given instance, oldest first.
    pub async fn get_instance_events(&self, instance_id: &Uuid) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, timestamp, kind, payload
             FROM workflow_events WHERE instance_id = ?1 ORDER BY timestamp ASC, rowid ASC",
        )?;
        let events = stmt
            .query_map(params![instance_id.to_string()], read_row)?
            .filter_map(|r| r.ok())
            .filter_map(into_event)
            .collect();
        Ok(events)
    }

    /// Get recent events across all instances.
    pub async fn get_recent(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, timestamp, kind, payload
             FROM workflow_events ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit], read_row)?
            .filter_map(|r| r.ok())
            .filter_map(into_event)
            .collect();
        Ok(events)
    }

    /// Count all events in the store.
    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: usize =
            conn.query_row("SELECT COUNT(*) FROM workflow_events", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS workflow_events (
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_instance_id ON workflow_events(instance_id);
        CREATE INDEX IF NOT EXISTS idx_events_kind ON workflow_events(kind);",
    )?;
    Ok(())
}

type EventRow = (String, String, i64, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_event((id, instance_id, timestamp, kind, payload): EventRow) -> Option<Event> {
    Some(Event {
        id: Uuid::parse_str(&id).ok()?,
        instance_id: Uuid::parse_str(&instance_id).ok()?,
        timestamp: chrono::DateTime::<chrono::Utc>::from_timestamp_micros(timestamp)?,
        kind: serde_json::from_value(serde_json::Value::String(kind)).ok()?,
        payload: serde_json::from_str(&payload).ok()?,
    })
}
