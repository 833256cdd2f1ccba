//! Persistence contracts for settings, conversations and users.
//!
//! Two back ends implement these traits: [`InMemoryStore`] (process-local,
//! nothing survives a restart) and [`crate::database::GaodDatabase`] (SQLite).
//! The chat pipeline only ever sees the traits, so tests run against fakes.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::auth::UserRecord;

pub const NEW_CHAT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Locally generated notices (quota rejections); never sent to a provider.
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" | "ai" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Attachment descriptor. File contents are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentMeta>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub messages: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: NEW_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_user_turn(&self) -> bool {
        self.messages.iter().any(|turn| turn.role == Role::User)
    }
}

/// Title from the first user turn: the first `max_chars` characters, with an
/// ellipsis only when something was cut.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let mut title: String = trimmed.chars().take(max_chars).collect();
    if trimmed.chars().count() > max_chars {
        title.push_str("...");
    }
    if title.is_empty() {
        NEW_CHAT_TITLE.to_string()
    } else {
        title
    }
}

/// Flat string key/value store. Read-your-writes within one process.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    /// Conversations owned by `user_id`, most recently updated first.
    async fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<Conversation>>;
    /// Append one turn and bump `updated_at`. Fails if the conversation is gone.
    async fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()>;
    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()>;
    /// Remove a conversation and all of its turns. Returns false if absent.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>>;
    async fn create_user(&self, user: &UserRecord) -> Result<()>;
    async fn list_users(&self) -> Result<Vec<UserRecord>>;
    async fn create_session(&self, token: &str, user_id: &str) -> Result<()>;
    async fn session_user_id(&self, token: &str) -> Result<Option<String>>;
    async fn delete_session(&self, token: &str) -> Result<()>;
}

#[derive(Default)]
struct InMemoryState {
    settings: HashMap<String, String>,
    conversations: Vec<Conversation>,
    users: Vec<UserRecord>,
    sessions: HashMap<String, String>,
}

/// Process-local store. Used by tests and when no database path is configured.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.settings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.write().await.settings.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut state = self.state.write().await;
        if state.conversations.iter().any(|c| c.id == conversation.id) {
            return Err(anyhow!("conversation '{}' already exists", conversation.id));
        }
        state.conversations.push(conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut owned: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        owned.truncate(limit);
        Ok(owned)
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| anyhow!("conversation '{}' not found", conversation_id))?;
        conversation.messages.push(turn.clone());
        conversation.updated_at = turn.timestamp.max(conversation.updated_at);
        Ok(())
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| anyhow!("conversation '{}' not found", conversation_id))?;
        conversation.title = title.to_string();
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let before = state.conversations.len();
        state.conversations.retain(|c| c.id != conversation_id);
        Ok(state.conversations.len() != before)
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let state = self.state.read().await;
        Ok(state
            .users
            .iter()
            .find(|u| u.user.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let state = self.state.read().await;
        Ok(state.users.iter().find(|u| u.user.id == user_id).cloned())
    }

    async fn create_user(&self, user: &UserRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .users
            .iter()
            .any(|u| u.user.email.eq_ignore_ascii_case(&user.user.email))
        {
            return Err(anyhow!("a user with that email already exists"));
        }
        state.users.push(user.clone());
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.state.read().await.users.clone())
    }

    async fn create_session(&self, token: &str, user_id: &str) -> Result<()> {
        self.state
            .write()
            .await
            .sessions
            .insert(token.to_string(), user_id.to_string());
        Ok(())
    }

    async fn session_user_id(&self, token: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        self.state.write().await.sessions.remove(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_title_truncates_with_ellipsis() {
        assert_eq!(derive_title("Hello world", 30), "Hello world");
        assert_eq!(
            derive_title("This sentence is definitely longer than thirty characters", 30),
            "This sentence is definitely lo..."
        );
        assert_eq!(derive_title("   ", 30), NEW_CHAT_TITLE);
    }

    #[test]
    fn derive_title_counts_characters_not_bytes() {
        let title = derive_title("ééééé", 3);
        assert_eq!(title, "ééé...");
    }

    #[test]
    fn only_user_turns_count_as_user_turns() {
        let mut conversation = Conversation::new("u1");
        assert!(!conversation.has_user_turn());
        conversation.messages.push(Turn::new(Role::System, "Rate limit exceeded."));
        assert!(!conversation.has_user_turn());
        conversation.messages.push(Turn::new(Role::User, "hi"));
        assert!(conversation.has_user_turn());
    }

    #[test]
    fn conversation_serializes_with_camel_case_shape() {
        let mut conversation = Conversation::new("u1");
        conversation.messages.push(Turn::new(Role::Assistant, "ok"));
        let value = serde_json::to_value(&conversation).unwrap();
        assert_eq!(value["userId"], "u1");
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["messages"][0]["role"], "assistant");
        assert!(value["messages"][0].get("attachments").is_none());
    }

    #[test]
    fn role_parse_accepts_legacy_ai_alias() {
        assert_eq!(Role::parse("ai"), Some(Role::Assistant));
        assert_eq!(Role::parse("USER"), Some(Role::User));
        assert_eq!(Role::parse("operator"), None);
    }

    #[tokio::test]
    async fn settings_read_your_writes() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn conversations_are_owner_scoped_and_deleted_whole() {
        let store = InMemoryStore::new();
        let mine = Conversation::new("alice");
        let theirs = Conversation::new("bob");
        store.create_conversation(&mine).await.unwrap();
        store.create_conversation(&theirs).await.unwrap();

        store
            .append_turn(&mine.id, &Turn::new(Role::User, "first"))
            .await
            .unwrap();
        store
            .append_turn(&mine.id, &Turn::new(Role::Assistant, "second"))
            .await
            .unwrap();

        let listed = store.list_conversations("alice", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].messages.len(), 2);
        assert_eq!(listed[0].messages[0].content, "first");

        assert!(store.delete_conversation(&mine.id).await.unwrap());
        assert!(!store.delete_conversation(&mine.id).await.unwrap());
        assert!(store.get_conversation(&mine.id).await.unwrap().is_none());
        assert!(store
            .append_turn(&mine.id, &Turn::new(Role::User, "late"))
            .await
            .is_err());
    }
}
