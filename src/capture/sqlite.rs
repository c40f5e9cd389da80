use super::model::{CaptureId, CaptureSummary, CapturedRequest, HeaderEntry, RequestSnapshot};
use super::store::{RequestStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// SQLite-backed request store. Each call opens its own connection on the
/// blocking pool; WAL mode lets concurrent readers proceed during writes.
pub struct SqliteRequestStore {
    db_path: PathBuf,
}

impl SqliteRequestStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("{}: {e}", parent.display())))?;
        }

        let conn = Connection::open(&db_path)?;
        initialize_schema(&conn)?;

        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {e}")))?
    }
}

pub fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS captured_requests (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            version TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            host TEXT NOT NULL,
            remote_addr TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_captured_requests_created_at
            ON captured_requests(created_at);",
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(String, CapturedFields)> {
    Ok((
        row.get(0)?,
        CapturedFields {
            created_at: row.get(1)?,
            method: row.get(2)?,
            url: row.get(3)?,
            version: row.get(4)?,
            headers: row.get(5)?,
            body: row.get(6)?,
            host: row.get(7)?,
            remote_addr: row.get(8)?,
        },
    ))
}

struct CapturedFields {
    created_at: i64,
    method: String,
    url: String,
    version: String,
    headers: String,
    body: Vec<u8>,
    host: String,
    remote_addr: Option<String>,
}

impl CapturedFields {
    fn into_record(self, id: String) -> Result<CapturedRequest, StoreError> {
        let id = id.parse::<CaptureId>().map_err(StoreError::Invalid)?;
        let headers: Vec<HeaderEntry> = serde_json::from_str(&self.headers)?;
        let created_at = DateTime::from_timestamp_millis(self.created_at)
            .ok_or_else(|| StoreError::Invalid(format!("bad timestamp {}", self.created_at)))?;

        Ok(CapturedRequest {
            id,
            request: RequestSnapshot {
                method: self.method,
                url: self.url,
                version: self.version,
                headers,
                body: self.body,
                host: self.host,
                remote_addr: self.remote_addr,
                created_at,
            },
        })
    }
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn save(&self, request: RequestSnapshot) -> Result<CaptureId, StoreError> {
        let id = CaptureId::generate();
        let row_id = id.to_string();
        self.with_connection(move |conn| {
            let headers = serde_json::to_string(&request.headers)?;
            conn.execute(
                "INSERT INTO captured_requests
                    (id, created_at, method, url, version, headers, body, host, remote_addr)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row_id,
                    request.created_at.timestamp_millis(),
                    request.method,
                    request.url,
                    request.version,
                    headers,
                    request.body,
                    request.host,
                    request.remote_addr,
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(id = %id, "Stored captured request");
        Ok(id)
    }

    async fn load(&self, id: &CaptureId) -> Result<Option<CapturedRequest>, StoreError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, created_at, method, url, version, headers, body, host, remote_addr
                     FROM captured_requests WHERE id = ?1",
                    [&id],
                    record_from_row,
                )
                .optional()?;

            row.map(|(id, fields)| fields.into_record(id)).transpose()
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<CaptureSummary>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, method, url, version, headers, body, host, remote_addr
                 FROM captured_requests ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], record_from_row)?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, fields) = row?;
                summaries.push(CaptureSummary::from(&fields.into_record(id)?));
            }
            Ok(summaries)
        })
        .await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = cutoff.timestamp_millis();
        self.with_connection(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM captured_requests WHERE created_at < ?1",
                [cutoff],
            )?;
            Ok(deleted)
        })
        .await
    }
}
