use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use weft_core::WeftError;
use weft_graph::{Checkpoint, CheckpointConfig, Checkpointer};

/// SQLite-backed graph checkpointer.
///
/// One row per checkpoint, keyed by `(thread_id, step)`. Blocking SQLite calls
/// run on `tokio::task::spawn_blocking`, and `put` returns only after the
/// statement has committed.
#[derive(Clone)]
pub struct SqliteCheckpointer {
    conn: Arc<Mutex<Connection>>,
}

fn storage(context: &str) -> impl Fn(rusqlite::Error) -> WeftError + '_ {
    move |e| WeftError::Storage(format!("SQLite {context}: {e}"))
}

impl SqliteCheckpointer {
    /// Open (or create) a checkpoint database file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, WeftError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(storage("open"))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(storage("journal_mode"))?;
        tracing::debug!(path = %path.display(), "opened checkpoint database");
        Self::init(conn)
    }

    /// Create an in-memory checkpointer (useful for testing).
    pub fn in_memory() -> Result<Self, WeftError> {
        let conn = Connection::open_in_memory().map_err(storage("open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, WeftError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS weft_checkpoints (
                thread_id  TEXT    NOT NULL,
                step       INTEGER NOT NULL,
                data       TEXT    NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (thread_id, step)
            );",
        )
        .map_err(storage("create table"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, WeftError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, WeftError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| WeftError::Storage(format!("lock: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(|e| WeftError::Storage(format!("spawn_blocking: {e}")))?
    }
}

fn decode(json: &str) -> Result<Checkpoint, WeftError> {
    serde_json::from_str(json).map_err(|e| WeftError::Storage(format!("deserialize: {e}")))
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
    ) -> Result<(), WeftError> {
        let thread_id = config.thread_id.clone();
        let step = i64::try_from(checkpoint.step)
            .map_err(|_| WeftError::Storage(format!("step {} out of range", checkpoint.step)))?;
        let data = serde_json::to_string(checkpoint)
            .map_err(|e| WeftError::Storage(format!("serialize: {e}")))?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO weft_checkpoints (thread_id, step, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![thread_id, step, data, now],
            )
            .map_err(storage("insert"))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>, WeftError> {
        let thread_id = config.thread_id.clone();

        self.with_conn(move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM weft_checkpoints \
                     WHERE thread_id = ?1 ORDER BY step DESC LIMIT 1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage("select"))?;
            data.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>, WeftError> {
        let thread_id = config.thread_id.clone();

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM weft_checkpoints \
                     WHERE thread_id = ?1 ORDER BY step ASC",
                )
                .map_err(storage("prepare"))?;
            let rows = stmt
                .query_map(params![thread_id], |row| row.get::<_, String>(0))
                .map_err(storage("query"))?;

            let mut checkpoints = Vec::new();
            for row in rows {
                let json = row.map_err(storage("row"))?;
                checkpoints.push(decode(&json)?);
            }
            Ok(checkpoints)
        })
        .await
    }

    async fn delete(&self, config: &CheckpointConfig) -> Result<(), WeftError> {
        let thread_id = config.thread_id.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM weft_checkpoints WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(storage("delete"))?;
            Ok(())
        })
        .await
    }
}
