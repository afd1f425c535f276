//! SQLite storage backend

use crate::{Storage, StorageError, StorageStats};
use async_trait::async_trait;
use coedit_core::DocumentId;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// SQLite storage backend
///
/// Embedded persistence suitable for single-node setups. Queries run on the
/// blocking pool so a slow disk never stalls the async workers.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        let storage = Self::with_connection(conn)?;
        debug!(path = %path.display(), "SQLite storage opened");
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Database(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Unavailable(e.to_string()))?
        .map_err(|e| StorageError::Database(e.to_string()))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StorageError> {
        let id = id.as_str().to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT state FROM documents WHERE id = ?1",
                params![id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        })
        .await
    }

    async fn save(&self, id: &DocumentId, state: &[u8]) -> Result<(), StorageError> {
        let id = id.as_str().to_string();
        let state = state.to_vec();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO documents (id, state, updated_at)
                VALUES (?1, ?2, strftime('%s', 'now') * 1000)
                ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    updated_at = excluded.updated_at
                "#,
                params![id, state],
            )
            .map(|_| ())
        })
        .await
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        self.run(|conn| {
            let (count, size): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(state)), 0) FROM documents",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(StorageStats {
                document_count: count as usize,
                total_size_bytes: size as usize,
            })
        })
        .await
    }
}
