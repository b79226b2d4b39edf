use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{
    ChatStore, ChatThread, ChatTurn, Role, StoreError, StoreResult, ThreadId, ThreadSummary, TurnId,
    UserId,
};

/// Process-local store. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_thread_id: ThreadId,
    next_turn_id: TurnId,
    threads: FxHashMap<ThreadId, ChatThread>,
    // Insertion order doubles as chronological order.
    turns: Vec<ChatTurn>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of turns stored for a thread.
    #[must_use]
    pub fn turn_count(&self, thread_id: ThreadId) -> usize {
        self.inner
            .lock()
            .turns
            .iter()
            .filter(|turn| turn.thread_id == thread_id)
            .count()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_thread(&self, user_id: UserId, title: &str) -> StoreResult<ThreadId> {
        let mut inner = self.inner.lock();
        inner.next_thread_id += 1;
        let id = inner.next_thread_id;
        let now = Utc::now();
        inner.threads.insert(
            id,
            ChatThread {
                id,
                user_id,
                title: title.to_string(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_thread(&self, thread_id: ThreadId) -> StoreResult<Option<ChatThread>> {
        Ok(self.inner.lock().threads.get(&thread_id).cloned())
    }

    async fn list_threads(&self, user_id: UserId) -> StoreResult<Vec<ThreadSummary>> {
        let inner = self.inner.lock();
        let mut summaries: Vec<ThreadSummary> = inner
            .threads
            .values()
            .filter(|thread| thread.user_id == user_id)
            .map(|thread| {
                let mut turns = inner.turns.iter().filter(|turn| turn.thread_id == thread.id);
                let message_count = turns.clone().count() as u64;
                ThreadSummary {
                    thread: thread.clone(),
                    message_count,
                    last_message: turns.next_back().map(|turn| turn.content.clone()),
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.thread
                .updated_at
                .cmp(&a.thread.updated_at)
                .then(b.thread.id.cmp(&a.thread.id))
        });
        Ok(summaries)
    }

    async fn insert_turn(
        &self,
        thread_id: ThreadId,
        role: Role,
        content: &str,
    ) -> StoreResult<TurnId> {
        let mut inner = self.inner.lock();
        if !inner.threads.contains_key(&thread_id) {
            return Err(StoreError::ThreadNotFound(thread_id));
        }
        inner.next_turn_id += 1;
        let id = inner.next_turn_id;
        inner.turns.push(ChatTurn {
            id,
            thread_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn recent_turns(&self, thread_id: ThreadId, limit: usize) -> StoreResult<Vec<ChatTurn>> {
        let inner = self.inner.lock();
        let mut recent: Vec<ChatTurn> = inner
            .turns
            .iter()
            .rev()
            .filter(|turn| turn.thread_id == thread_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn list_turns(&self, thread_id: ThreadId) -> StoreResult<Vec<ChatTurn>> {
        Ok(self
            .inner
            .lock()
            .turns
            .iter()
            .filter(|turn| turn.thread_id == thread_id)
            .cloned()
            .collect())
    }

    async fn touch_thread(&self, thread_id: ThreadId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let thread = inner
            .threads
            .get_mut(&thread_id)
            .ok_or(StoreError::ThreadNotFound(thread_id))?;
        thread.updated_at = Utc::now();
        Ok(())
    }

    async fn get_turn(&self, turn_id: TurnId) -> StoreResult<Option<ChatTurn>> {
        Ok(self
            .inner
            .lock()
            .turns
            .iter()
            .find(|turn| turn.id == turn_id)
            .cloned())
    }

    async fn delete_thread(&self, user_id: UserId, thread_id: ThreadId) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let owned = inner
            .threads
            .get(&thread_id)
            .is_some_and(|thread| thread.user_id == user_id);
        if !owned {
            return Ok(false);
        }
        inner.threads.remove(&thread_id);
        inner.turns.retain(|turn| turn.thread_id != thread_id);
        Ok(true)
    }
}
