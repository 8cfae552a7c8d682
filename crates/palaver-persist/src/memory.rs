use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{PersistError, Result};
use crate::models::{Project, StoredMessage, Thread, ThreadQuery, Visibility};
use crate::store::ThreadStore;

#[derive(Default)]
struct Tables {
    threads: HashMap<String, Thread>,
    messages: HashMap<String, Vec<StoredMessage>>,
    projects: Vec<Project>,
}

impl Tables {
    fn thread_mut(&mut self, thread_id: &str) -> Result<&mut Thread> {
        self.threads
            .get_mut(thread_id)
            .ok_or_else(|| PersistError::ThreadNotFound(thread_id.to_string()))
    }
}

/// Process-local store used by tests and the default server configuration
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryStore {
    async fn create_thread(&self, thread: Thread) -> Result<Thread> {
        let mut tables = self.tables.write().await;
        if tables.threads.contains_key(&thread.id) {
            return Err(PersistError::Internal(format!(
                "thread {} already exists",
                thread.id
            )));
        }
        tables.messages.entry(thread.id.clone()).or_default();
        tables.threads.insert(thread.id.clone(), thread.clone());
        tracing::debug!(thread_id = %thread.id, user_id = %thread.user_id, "Created thread");
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.tables.read().await.threads.get(thread_id).cloned())
    }

    async fn list_threads(&self, query: ThreadQuery) -> Result<Vec<Thread>> {
        let tables = self.tables.read().await;
        let mut threads: Vec<Thread> = tables
            .threads
            .values()
            .filter(|t| t.user_id == query.user_id)
            .filter(|t| match &query.project_id {
                Some(project_id) => t.project_id.as_deref() == Some(project_id.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        threads.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        threads.truncate(query.limit);
        Ok(threads)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.threads.remove(thread_id).is_none() {
            return Err(PersistError::ThreadNotFound(thread_id.to_string()));
        }
        tables.messages.remove(thread_id);
        Ok(())
    }

    async fn change_title(&self, thread_id: &str, title: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let thread = tables.thread_mut(thread_id)?;
        thread.title = Some(title.to_string());
        thread.updated_at = Utc::now();
        Ok(())
    }

    async fn set_pinned(&self, thread_id: &str, pinned: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.thread_mut(thread_id)?.pinned = pinned;
        Ok(())
    }

    async fn set_visibility(&self, thread_id: &str, visibility: Visibility) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.thread_mut(thread_id)?.visibility = visibility;
        Ok(())
    }

    async fn set_project(&self, thread_id: &str, project_id: Option<&str>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(project_id) = project_id {
            if !tables.projects.iter().any(|p| p.id == project_id) {
                return Err(PersistError::ProjectNotFound(project_id.to_string()));
            }
        }
        tables.thread_mut(thread_id)?.project_id = project_id.map(str::to_string);
        Ok(())
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>> {
        let tables = self.tables.read().await;
        if !tables.threads.contains_key(thread_id) {
            return Err(PersistError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(tables.messages.get(thread_id).cloned().unwrap_or_default())
    }

    async fn save_messages(&self, messages: Vec<StoredMessage>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for message in messages {
            let thread = tables.thread_mut(&message.thread_id)?;
            thread.updated_at = Utc::now();

            let rows = tables.messages.entry(message.thread_id.clone()).or_default();
            match rows.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message,
                None => rows.push(message),
            }
        }
        Ok(())
    }

    async fn create_project(&self, user_id: &str, name: &str) -> Result<Project> {
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.tables.write().await.projects.push(project.clone());
        Ok(project)
    }

    async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let tables = self.tables.read().await;
        Ok(tables
            .projects
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }
}
