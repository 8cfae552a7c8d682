use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Project, StoredMessage, Thread, ThreadQuery, Visibility};

/// Thread/message persistence contract consumed by chat sessions and the API
///
/// Implementations return messages in conversation order and treat
/// `save_messages` as an upsert keyed by message id.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn create_thread(&self, thread: Thread) -> Result<Thread>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;

    /// Pinned threads first, then most recently updated
    async fn list_threads(&self, query: ThreadQuery) -> Result<Vec<Thread>>;

    /// Removes the thread and all of its messages
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    async fn change_title(&self, thread_id: &str, title: &str) -> Result<()>;

    async fn set_pinned(&self, thread_id: &str, pinned: bool) -> Result<()>;

    async fn set_visibility(&self, thread_id: &str, visibility: Visibility) -> Result<()>;

    async fn set_project(&self, thread_id: &str, project_id: Option<&str>) -> Result<()>;

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>>;

    async fn save_messages(&self, messages: Vec<StoredMessage>) -> Result<()>;

    async fn create_project(&self, user_id: &str, name: &str) -> Result<Project>;

    async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>>;
}
