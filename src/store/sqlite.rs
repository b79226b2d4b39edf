use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    ChatStore, ChatThread, ChatTurn, Role, StoreError, StoreResult, ThreadId, ThreadSummary, TurnId,
    UserId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL REFERENCES threads(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages (thread_id, id);
";

/// SQLite-backed store. One connection, serialized behind a mutex and only
/// touched from blocking tasks.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or migrated.
    pub async fn open(path: String) -> StoreResult<Self> {
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            tracing::debug!(path = %path, "sqlite store ready");
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }

    /// In-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ChatThread> {
    Ok(ChatThread {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        updated_at: from_millis(row.get(4)?),
    })
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<ChatTurn> {
    let role: String = row.get(2)?;
    Ok(ChatTurn {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: Role::from_stored(&role),
        content: row.get(3)?,
        created_at: from_millis(row.get(4)?),
    })
}

fn thread_exists(conn: &Connection, thread_id: ThreadId) -> StoreResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM threads WHERE id = ?1",
            params![thread_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_thread(&self, user_id: UserId, title: &str) -> StoreResult<ThreadId> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO threads (user_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![user_id, title, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_thread(&self, thread_id: ThreadId) -> StoreResult<Option<ChatThread>> {
        self.with_conn(move |conn| {
            let thread = conn
                .query_row(
                    "SELECT id, user_id, title, created_at, updated_at FROM threads WHERE id = ?1",
                    params![thread_id],
                    thread_from_row,
                )
                .optional()?;
            Ok(thread)
        })
        .await
    }

    async fn list_threads(&self, user_id: UserId) -> StoreResult<Vec<ThreadSummary>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.user_id, t.title, t.created_at, t.updated_at,
                    (SELECT COUNT(*) FROM messages WHERE thread_id = t.id),
                    (SELECT content FROM messages WHERE thread_id = t.id ORDER BY id DESC LIMIT 1)
                 FROM threads t WHERE t.user_id = ?1
                 ORDER BY t.updated_at DESC, t.id DESC",
            )?;
            let threads = stmt
                .query_map(params![user_id], |row| {
                    let count: i64 = row.get(5)?;
                    Ok(ThreadSummary {
                        thread: thread_from_row(row)?,
                        message_count: u64::try_from(count).unwrap_or_default(),
                        last_message: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(threads)
        })
        .await
    }

    async fn insert_turn(
        &self,
        thread_id: ThreadId,
        role: Role,
        content: &str,
    ) -> StoreResult<TurnId> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            if !thread_exists(conn, thread_id)? {
                return Err(StoreError::ThreadNotFound(thread_id));
            }
            conn.execute(
                "INSERT INTO messages (thread_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![thread_id, role.as_str(), content, now_millis()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn recent_turns(&self, thread_id: ThreadId, limit: usize) -> StoreResult<Vec<ChatTurn>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, role, content, created_at FROM messages
                 WHERE thread_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut turns = stmt
                .query_map(params![thread_id, limit], turn_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    async fn list_turns(&self, thread_id: ThreadId) -> StoreResult<Vec<ChatTurn>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, role, content, created_at FROM messages
                 WHERE thread_id = ?1 ORDER BY id ASC",
            )?;
            let turns = stmt
                .query_map(params![thread_id], turn_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(turns)
        })
        .await
    }

    async fn touch_thread(&self, thread_id: ThreadId) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
                params![now_millis(), thread_id],
            )?;
            if changed == 0 {
                return Err(StoreError::ThreadNotFound(thread_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_turn(&self, turn_id: TurnId) -> StoreResult<Option<ChatTurn>> {
        self.with_conn(move |conn| {
            let turn = conn
                .query_row(
                    "SELECT id, thread_id, role, content, created_at FROM messages WHERE id = ?1",
                    params![turn_id],
                    turn_from_row,
                )
                .optional()?;
            Ok(turn)
        })
        .await
    }

    async fn delete_thread(&self, user_id: UserId, thread_id: ThreadId) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let owned = conn
                .query_row(
                    "SELECT 1 FROM threads WHERE id = ?1 AND user_id = ?2",
                    params![thread_id, user_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !owned {
                return Ok(false);
            }
            // Turns reference the thread, so they go first.
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM messages WHERE thread_id = ?1", params![thread_id])?;
            tx.execute(
                "DELETE FROM threads WHERE id = ?1 AND user_id = ?2",
                params![thread_id, user_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }
}
