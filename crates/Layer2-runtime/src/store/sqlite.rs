//! SQLite findings store
//!
//! Each category lives in its own table keyed by `workspace_id`.
//! A table the data layer has not created yet counts as zero.

use super::{FindingsStore, StoreError};
use async_trait::async_trait;
use kestrel_foundation::{FindingCategory, FindingCounts, WorkspaceId};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Read-only view over the findings database
pub struct SqliteFindingsStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteFindingsStore {
    /// Open an existing database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|e| {
            StoreError::Unavailable(format!("Failed to open {}: {}", path.display(), e))
        })?;

        // Readers must not block the writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| StoreError::Unavailable(format!("Failed to set pragmas: {}", e)))?;

        debug!(path = %path.display(), "Opened findings database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Unavailable(format!("Failed to create in-memory database: {}", e))
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run raw SQL against the database (schema and fixture setup)
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("Lock poisoned".to_string()))?;
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn count_blocking(conn: &Connection, workspace_id: WorkspaceId) -> Result<FindingCounts, StoreError> {
        let mut counts = FindingCounts::default();

        for category in FindingCategory::ALL {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE workspace_id = ?1",
                category.as_str()
            );
            let value = match conn.query_row(&sql, params![workspace_id.get()], |row| {
                row.get::<_, i64>(0)
            }) {
                Ok(value) => value,
                Err(e) if is_missing_table(&e) => {
                    trace!(table = category.as_str(), "Findings table missing, counting as zero");
                    0
                }
                Err(e) => {
                    return Err(StoreError::Query(format!(
                        "Failed to count {}: {}",
                        category, e
                    )))
                }
            };
            counts.set(category, value.max(0) as u64);
        }

        Ok(counts)
    }
}

fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("no such table"))
}

#[async_trait]
impl FindingsStore for SqliteFindingsStore {
    async fn count_findings(&self, workspace_id: WorkspaceId) -> Result<FindingCounts, StoreError> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("Lock poisoned".to_string()))?;
            Self::count_blocking(&conn, workspace_id)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("Count task failed: {}", e)))?
    }
}
