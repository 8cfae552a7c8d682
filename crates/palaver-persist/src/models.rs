use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub visibility: Visibility,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// New private, unpinned thread with a caller-chosen id
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: None,
            pinned: false,
            visibility: Visibility::Private,
            project_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Filter for listing a user's threads
#[derive(Debug, Clone)]
pub struct ThreadQuery {
    pub user_id: String,
    pub project_id: Option<String>,
    pub limit: usize,
}

impl ThreadQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: None,
            limit: 20,
        }
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Grouping of threads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted message row. Tool results are their own rows (`role: tool`)
/// pointing back at the assistant's call through `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub thread_id: String,
    pub role: StoredRole,
    pub content: String,
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<StoredToolCall>,
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub status: StoredMessageStatus,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    fn base(thread_id: &str, role: StoredRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            role,
            content,
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            status: StoredMessageStatus::Done,
            created_at: Utc::now(),
        }
    }

    pub fn user(thread_id: &str, content: impl Into<String>) -> Self {
        Self::base(thread_id, StoredRole::User, content.into())
    }

    pub fn assistant(thread_id: &str, content: impl Into<String>) -> Self {
        Self::base(thread_id, StoredRole::Assistant, content.into())
    }

    pub fn tool(thread_id: &str, tool_call_id: impl Into<String>, result: impl Into<String>) -> Self {
        let mut message = Self::base(thread_id, StoredRole::Tool, result.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn with_tool_call(mut self, call: StoredToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredMessageStatus {
    #[default]
    Done,
    Incomplete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl StoredToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}
