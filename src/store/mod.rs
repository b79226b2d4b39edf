//! Chat persistence: threads and the turns they own.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{StorageBackend, StorageConfig};
use crate::transport::RetryPolicy;

pub type ThreadId = i64;
pub type TurnId = i64;
pub type UserId = i64;

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored role; anything that is not `assistant` is a user turn.
    #[must_use]
    pub fn from_stored(value: &str) -> Self {
        if value == "assistant" {
            Role::Assistant
        } else {
            Role::User
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted message. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub id: TurnId,
    pub thread_id: ThreadId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatThread {
    pub id: ThreadId,
    pub user_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A thread as listed for its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    #[serde(flatten)]
    pub thread: ChatThread,
    pub message_count: u64,
    pub last_message: Option<String>,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// The message store the relay writes through.
///
/// Every write is a single-row operation; nothing spans a streamed response.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_thread(&self, user_id: UserId, title: &str) -> StoreResult<ThreadId>;
    async fn get_thread(&self, thread_id: ThreadId) -> StoreResult<Option<ChatThread>>;
    /// Threads owned by `user_id`, most recently updated first.
    async fn list_threads(&self, user_id: UserId) -> StoreResult<Vec<ThreadSummary>>;
    async fn insert_turn(&self, thread_id: ThreadId, role: Role, content: &str)
        -> StoreResult<TurnId>;
    /// The most recent `limit` turns, oldest first.
    async fn recent_turns(&self, thread_id: ThreadId, limit: usize) -> StoreResult<Vec<ChatTurn>>;
    async fn list_turns(&self, thread_id: ThreadId) -> StoreResult<Vec<ChatTurn>>;
    async fn touch_thread(&self, thread_id: ThreadId) -> StoreResult<()>;
    async fn get_turn(&self, turn_id: TurnId) -> StoreResult<Option<ChatTurn>>;
    /// Remove a thread owned by `user_id` together with its turns.
    ///
    /// Returns `false` when no such thread belongs to the user.
    async fn delete_thread(&self, user_id: UserId, thread_id: ThreadId) -> StoreResult<bool>;
}

/// Open the configured store, retrying per `storage.open_retry`.
///
/// # Errors
///
/// Returns the last [`StoreError`] once every attempt has failed.
pub async fn open_store(config: &StorageConfig) -> StoreResult<Arc<dyn ChatStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            let policy = RetryPolicy::from_config(&config.open_retry);
            let path = config.path.clone();
            let store = policy
                .run("open sqlite store", || SqliteStore::open(path.clone()))
                .await?;
            Ok(Arc::new(store))
        }
    }
}
