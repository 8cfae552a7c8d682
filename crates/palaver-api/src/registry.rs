use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use palaver_chat::ChatSession;

/// Live sessions by thread id; at most one turn in flight per thread
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ChatSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` for its thread. Returns `None` when the thread
    /// already has a live session.
    pub fn claim(&self, session: ChatSession) -> Option<Arc<ChatSession>> {
        let mut sessions = self.lock();
        if sessions.contains_key(session.thread_id()) {
            return None;
        }
        let session = Arc::new(session);
        sessions.insert(session.thread_id().to_string(), Arc::clone(&session));
        Some(session)
    }

    pub fn is_live(&self, thread_id: &str) -> bool {
        self.lock().contains_key(thread_id)
    }

    pub fn get(&self, thread_id: &str) -> Option<Arc<ChatSession>> {
        self.lock().get(thread_id).cloned()
    }

    pub fn release(&self, thread_id: &str) {
        if self.lock().remove(thread_id).is_some() {
            tracing::debug!(thread_id, "Released chat session");
        }
    }

    /// Stop the thread's in-flight turn, if any
    pub async fn stop(&self, thread_id: &str) -> bool {
        match self.get(thread_id) {
            Some(session) => session.stop().await,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChatSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
