//! Keeps one live assistant session handle per (tenant, user_handle) pair
//! and serializes turns through it (C5). Generalizes the teacher's
//! `SessionManager::handles: RwLock<HashMap<String, Arc<SessionHandle>>>`
//! from CLI-provider sessions to assistant-subprocess sessions, and folds
//! the "busy" flag and the pending-turn queue into a single per-session
//! `tokio::sync::Mutex` so a turn holds the lock for its whole duration —
//! closing the race the teacher's separate status-column + in-memory-handle
//! approach would otherwise leave between checking and claiming a session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::assistant::AssistantProcess;
use crate::errors::EngineError;

struct SessionInner {
    session_key: String,
    last_used: Instant,
}

/// A handle to one tenant/user's conversation. The mutex is held for the
/// full duration of a turn, so a second inbound message for the same user
/// queues behind it rather than racing a `isProcessing` flag.
pub struct SessionHandle {
    inner: Mutex<SessionInner>,
}

pub struct SessionPool {
    assistant: Arc<dyn AssistantProcess>,
    handles: RwLock<HashMap<(Uuid, String), Arc<SessionHandle>>>,
    idle_timeout: Duration,
    persistent: bool,
}

impl SessionPool {
    pub fn new(assistant: Arc<dyn AssistantProcess>, idle_timeout: Duration, persistent: bool) -> Self {
        Self {
            assistant,
            handles: RwLock::new(HashMap::new()),
            idle_timeout,
            persistent,
        }
    }

    pub async fn has(&self, tenant_id: Uuid, user_handle: &str) -> bool {
        self.handles
            .read()
            .await
            .contains_key(&(tenant_id, user_handle.to_string()))
    }

    pub async fn count(&self) -> usize {
        self.handles.read().await.len()
    }

    async fn get_or_create(&self, tenant_id: Uuid, user_handle: &str, session_key: &str) -> Arc<SessionHandle> {
        let key = (tenant_id, user_handle.to_string());
        if let Some(handle) = self.handles.read().await.get(&key) {
            return handle.clone();
        }
        let mut handles = self.handles.write().await;
        handles
            .entry(key)
            .or_insert_with(|| {
                Arc::new(SessionHandle {
                    inner: Mutex::new(SessionInner {
                        session_key: session_key.to_string(),
                        last_used: Instant::now(),
                    }),
                })
            })
            .clone()
    }

    /// Runs `prompt` through the assistant for (tenant, user), creating a
    /// handle on first use and serializing concurrent turns for the same
    /// user behind the handle's mutex. `resume` should be true whenever the
    /// caller's `session_key` matches the previous call's (i.e. no `/reset`
    /// happened in between).
    pub async fn send(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        session_key: &str,
        resume: bool,
        prompt: &str,
    ) -> Result<String, EngineError> {
        let handle = self.get_or_create(tenant_id, user_handle, session_key).await;
        let mut guard = handle.inner.lock().await;

        // session_key changed underneath us (a `/reset` landed between
        // enqueueing and our turn reaching the front) — never resume stale
        // context silently.
        let actually_resume = resume && guard.session_key == session_key;
        guard.session_key = session_key.to_string();
        guard.last_used = Instant::now();

        let reply = self
            .assistant
            .call(session_key, actually_resume, prompt)
            .await?;
        Ok(reply)
    }

    /// Drops the handle for (tenant, user) without killing an in-flight
    /// subprocess; used after `/reset` once the old session has ended.
    pub async fn close(&self, tenant_id: Uuid, user_handle: &str) {
        self.handles
            .write()
            .await
            .remove(&(tenant_id, user_handle.to_string()));
    }

    pub async fn close_all(&self) {
        let handles: Vec<_> = self.handles.read().await.values().cloned().collect();
        for handle in handles {
            let session_key = handle.inner.lock().await.session_key.clone();
            self.assistant.kill(&session_key).await;
        }
        self.handles.write().await.clear();
    }

    /// Background eviction loop: drops handles idle longer than
    /// `idle_timeout`, unless `persistent` is set. Intended to run for the
    /// lifetime of the process via `tokio::spawn`.
    pub async fn run_idle_eviction(self: Arc<Self>) {
        if self.persistent {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut handles = self.handles.write().await;
            let before = handles.len();
            let mut evicted = Vec::new();
            handles.retain(|_key, handle| match handle.inner.try_lock() {
                Ok(guard) => {
                    let keep = now.duration_since(guard.last_used) < self.idle_timeout;
                    if !keep {
                        evicted.push(guard.session_key.clone());
                    }
                    keep
                }
                Err(_) => true,
            });
            drop(handles);
            for session_key in &evicted {
                self.assistant.kill(session_key).await;
            }
            if !evicted.is_empty() {
                info!(count = evicted.len(), remaining = before - evicted.len(), "evicted idle sessions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::FakeAssistantProcess;

    #[tokio::test]
    async fn creates_and_reuses_handle() {
        let assistant = Arc::new(FakeAssistantProcess::new());
        let pool = SessionPool::new(assistant, Duration::from_secs(900), false);
        let tenant = Uuid::new_v4();
        assert!(!pool.has(tenant, "alice").await);
        pool.send(tenant, "alice", "s1", false, "hi").await.unwrap();
        assert!(pool.has(tenant, "alice").await);
        assert_eq!(pool.count().await, 1);
    }

    #[tokio::test]
    async fn session_key_change_disables_resume() {
        let assistant = Arc::new(FakeAssistantProcess::new());
        let pool = SessionPool::new(assistant.clone(), Duration::from_secs(900), false);
        let tenant = Uuid::new_v4();
        pool.send(tenant, "alice", "s1", false, "hi").await.unwrap();
        pool.send(tenant, "alice", "s2", true, "hi again").await.unwrap();
        let calls = assistant.calls();
        assert_eq!(calls[1].1, false, "resume must not be honored across a session_key change");
    }

    #[tokio::test]
    async fn close_removes_handle() {
        let assistant = Arc::new(FakeAssistantProcess::new());
        let pool = SessionPool::new(assistant, Duration::from_secs(900), false);
        let tenant = Uuid::new_v4();
        pool.send(tenant, "alice", "s1", false, "hi").await.unwrap();
        pool.close(tenant, "alice").await;
        assert!(!pool.has(tenant, "alice").await);
    }
}
