//! SQLite-backed document store for ScanResult snapshots.
//!
//! Each row holds the complete JSON document, so a reader never sees a merge
//! of two writes. Writes that would move a record back to a lower OCR state
//! are ignored.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use deepeyes_core::{DeepEyesError, ResultStore, ScanResult};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scan_results (
        id          TEXT PRIMARY KEY,
        image       TEXT NOT NULL,
        ocr_state   TEXT NOT NULL,
        ocr_rank    INTEGER NOT NULL,
        document    TEXT NOT NULL,
        updated_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_scan_results_updated ON scan_results(updated_at);";

pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

impl SqliteResultStore {
    /// Open or create the result store at the given path.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open result database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize scan_results schema")?;
        info!(path = ?path.as_ref(), "Result store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn count(&self) -> Result<usize, DeepEyesError> {
        let conn = self.conn.lock().await;
        let count: usize = conn
            .query_row("SELECT COUNT(*) FROM scan_results", [], |row| row.get(0))
            .map_err(read_err)?;
        Ok(count)
    }
}

fn read_err(e: rusqlite::Error) -> DeepEyesError {
    DeepEyesError::Other(anyhow::Error::new(e).context("result store read failed"))
}

fn decode(document: String) -> Result<ScanResult, DeepEyesError> {
    Ok(serde_json::from_str(&document)?)
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn upsert(&self, result: &ScanResult) -> Result<(), DeepEyesError> {
        let document = serde_json::to_string(result)?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT INTO scan_results (id, image, ocr_state, ocr_rank, document, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    image = excluded.image,
                    ocr_state = excluded.ocr_state,
                    ocr_rank = excluded.ocr_rank,
                    document = excluded.document,
                    updated_at = excluded.updated_at
                 WHERE excluded.ocr_rank >= scan_results.ocr_rank",
                params![
                    result.id,
                    result.image,
                    result.ocr.state.as_str(),
                    result.ocr.state.rank(),
                    document,
                    result.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| DeepEyesError::StoreWrite(e.to_string()))?;

        if changed == 0 {
            debug!(id = %result.id, ocr = %result.ocr.state, "Ignored stale result write");
        } else {
            debug!(id = %result.id, ocr = %result.ocr.state, "Result upserted");
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScanResult>, DeepEyesError> {
        let conn = self.conn.lock().await;
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM scan_results WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?;
        document.map(decode).transpose()
    }

    async fn list(&self) -> Result<Vec<ScanResult>, DeepEyesError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT document FROM scan_results ORDER BY updated_at DESC")
            .map_err(read_err)?;
        let documents: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(read_err)?
            .filter_map(|r| r.ok())
            .collect();
        documents.into_iter().map(decode).collect()
    }
}
