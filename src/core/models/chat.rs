use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Set on assistant messages explaining a failed send
    #[serde(default)]
    pub is_error: bool,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            is_error: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant-style notice inserted when a send could not complete.
    pub fn failure_notice(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(Role::Assistant, content)
        }
    }
}

/// Persisted transcript of one conversation with an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub agent_id: String,
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.updated_at = message.created_at;
        self.messages.push(message);
    }
}
