use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::warn;

/// Metadata recorded for a downloaded attachment.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub msg_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
}

/// Persistence capability consumed by the orchestration core.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_file_metadata(&self, meta: &FileMetadata) -> Result<()>;

    /// Remove records older than `days`, optionally deleting the files from
    /// disk as well. Returns the number of removed records.
    async fn cleanup_old_files(&self, days: u32, delete_from_disk: bool) -> Result<u64>;
}

/// SQLite-backed file-metadata store.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                msg_id TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                mime_type TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .context("Failed to create files table")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_file_metadata(&self, meta: &FileMetadata) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO files
             (msg_id, file_name, file_path, file_size, mime_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                meta.msg_id,
                meta.file_name,
                meta.file_path,
                meta.file_size as i64,
                meta.mime_type,
                chrono::Utc::now().timestamp(),
            ],
        )
        .context("Failed to insert file metadata")?;
        Ok(())
    }

    async fn cleanup_old_files(&self, days: u32, delete_from_disk: bool) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * 86_400;
        let conn = self.conn.lock().await;

        if delete_from_disk {
            let mut stmt = conn
                .prepare("SELECT file_path FROM files WHERE created_at < ?1")
                .context("Failed to prepare cleanup query")?;
            let paths = stmt
                .query_map(rusqlite::params![cutoff], |row| row.get::<_, String>(0))
                .context("Failed to query expired files")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to collect expired file paths")?;
            for path in paths {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to delete expired file {}: {}", path, e);
                    }
                }
            }
        }

        let deleted = conn
            .execute(
                "DELETE FROM files WHERE created_at < ?1",
                rusqlite::params![cutoff],
            )
            .context("Failed to delete expired file records")?;
        Ok(deleted as u64)
    }
}
