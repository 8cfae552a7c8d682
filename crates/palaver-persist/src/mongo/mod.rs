use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use bson::doc;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, Result};
use crate::models::{
    Project, StoredMessage, StoredMessageStatus, StoredRole, StoredToolCall, Thread, ThreadQuery,
    Visibility,
};
use crate::store::ThreadStore;

/// Thread document; ids stay as strings so guests and users share one keyspace
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThreadDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    pinned: bool,
    visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageDocument {
    #[serde(rename = "_id")]
    id: String,
    thread_id: String,
    role: StoredRole,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StoredToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    status: StoredMessageStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    /// Position within the saving batch; breaks `created_at` ties
    #[serde(default)]
    seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    name: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
}

impl From<Thread> for ThreadDocument {
    fn from(t: Thread) -> Self {
        Self {
            id: t.id,
            user_id: t.user_id,
            title: t.title,
            pinned: t.pinned,
            visibility: t.visibility,
            project_id: t.project_id,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

impl From<ThreadDocument> for Thread {
    fn from(d: ThreadDocument) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id,
            title: d.title,
            pinned: d.pinned,
            visibility: d.visibility,
            project_id: d.project_id,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

impl From<StoredMessage> for MessageDocument {
    fn from(m: StoredMessage) -> Self {
        Self {
            id: m.id,
            thread_id: m.thread_id,
            role: m.role,
            content: m.content,
            reasoning: m.reasoning,
            tool_calls: m.tool_calls,
            tool_call_id: m.tool_call_id,
            status: m.status,
            created_at: m.created_at,
            seq: 0,
        }
    }
}

impl From<MessageDocument> for StoredMessage {
    fn from(d: MessageDocument) -> Self {
        Self {
            id: d.id,
            thread_id: d.thread_id,
            role: d.role,
            content: d.content,
            reasoning: d.reasoning,
            tool_calls: d.tool_calls,
            tool_call_id: d.tool_call_id,
            status: d.status,
            created_at: d.created_at,
        }
    }
}

impl From<ProjectDocument> for Project {
    fn from(d: ProjectDocument) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id,
            name: d.name,
            created_at: d.created_at,
        }
    }
}

/// MongoDB-backed store; collections `threads`, `messages` and `projects`
#[derive(Clone)]
pub struct MongoStore {
    threads: Collection<ThreadDocument>,
    messages: Collection<MessageDocument>,
    projects: Collection<ProjectDocument>,
}

impl MongoStore {
    pub async fn connect(mongodb_uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(mongodb_uri)
            .await
            .map_err(|e| PersistError::Connection(e.to_string()))?;
        let db = client.database(database);
        tracing::info!(database, "Connected to MongoDB");

        Ok(Self {
            threads: db.collection("threads"),
            messages: db.collection("messages"),
            projects: db.collection("projects"),
        })
    }

    async fn update_thread(&self, thread_id: &str, set: bson::Document) -> Result<()> {
        let result = self
            .threads
            .update_one(doc! { "_id": thread_id }, doc! { "$set": set })
            .await?;
        if result.matched_count == 0 {
            return Err(PersistError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    async fn ensure_thread(&self, thread_id: &str) -> Result<()> {
        if self.threads.find_one(doc! { "_id": thread_id }).await?.is_none() {
            return Err(PersistError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for MongoStore {
    async fn create_thread(&self, thread: Thread) -> Result<Thread> {
        self.threads
            .insert_one(ThreadDocument::from(thread.clone()))
            .await?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let found = self.threads.find_one(doc! { "_id": thread_id }).await?;
        Ok(found.map(Thread::from))
    }

    async fn list_threads(&self, query: ThreadQuery) -> Result<Vec<Thread>> {
        let mut filter = doc! { "user_id": &query.user_id };
        if let Some(project_id) = &query.project_id {
            filter.insert("project_id", project_id);
        }

        let threads: Vec<ThreadDocument> = self
            .threads
            .find(filter)
            .sort(doc! { "pinned": -1, "updated_at": -1 })
            .limit(query.limit as i64)
            .await?
            .try_collect()
            .await?;
        Ok(threads.into_iter().map(Thread::from).collect())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let result = self.threads.delete_one(doc! { "_id": thread_id }).await?;
        if result.deleted_count == 0 {
            return Err(PersistError::ThreadNotFound(thread_id.to_string()));
        }
        self.messages
            .delete_many(doc! { "thread_id": thread_id })
            .await?;
        Ok(())
    }

    async fn change_title(&self, thread_id: &str, title: &str) -> Result<()> {
        self.update_thread(thread_id, doc! { "title": title, "updated_at": bson::DateTime::now() })
            .await
    }

    async fn set_pinned(&self, thread_id: &str, pinned: bool) -> Result<()> {
        self.update_thread(thread_id, doc! { "pinned": pinned }).await
    }

    async fn set_visibility(&self, thread_id: &str, visibility: Visibility) -> Result<()> {
        let visibility = bson::to_bson(&visibility)?;
        self.update_thread(thread_id, doc! { "visibility": visibility })
            .await
    }

    async fn set_project(&self, thread_id: &str, project_id: Option<&str>) -> Result<()> {
        if let Some(project_id) = project_id {
            if self
                .projects
                .find_one(doc! { "_id": project_id })
                .await?
                .is_none()
            {
                return Err(PersistError::ProjectNotFound(project_id.to_string()));
            }
        }
        self.update_thread(thread_id, doc! { "project_id": project_id })
            .await
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>> {
        self.ensure_thread(thread_id).await?;
        let messages: Vec<MessageDocument> = self
            .messages
            .find(doc! { "thread_id": thread_id })
            .sort(doc! { "created_at": 1, "seq": 1 })
            .await?
            .try_collect()
            .await?;
        Ok(messages.into_iter().map(StoredMessage::from).collect())
    }

    async fn save_messages(&self, messages: Vec<StoredMessage>) -> Result<()> {
        for (seq, message) in messages.into_iter().enumerate() {
            let thread_id = message.thread_id.clone();
            let id = message.id.clone();
            self.ensure_thread(&thread_id).await?;
            let document = MessageDocument {
                seq: seq as i64,
                ..MessageDocument::from(message)
            };
            self.messages
                .replace_one(doc! { "_id": &id }, document)
                .upsert(true)
                .await?;
            self.update_thread(&thread_id, doc! { "updated_at": bson::DateTime::now() })
                .await?;
        }
        Ok(())
    }

    async fn create_project(&self, user_id: &str, name: &str) -> Result<Project> {
        let document = ProjectDocument {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.projects.insert_one(&document).await?;
        Ok(document.into())
    }

    async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let projects: Vec<ProjectDocument> = self
            .projects
            .find(doc! { "user_id": user_id })
            .sort(doc! { "created_at": 1 })
            .await?
            .try_collect()
            .await?;
        Ok(projects.into_iter().map(Project::from).collect())
    }
}
