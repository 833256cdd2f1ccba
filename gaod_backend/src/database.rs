use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::auth::{User, UserRecord, UserRole};
use crate::store::{
    AttachmentMeta, Conversation, ConversationStore, Role, SettingsStore, Turn, UserStore,
};

/// SQLite-backed implementation of every store trait.
pub struct GaodDatabase {
    conn: Mutex<Connection>,
}

fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl GaodDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                password_salt TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // Turns keep insertion order via the rowid
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_conversations_user ON chat_conversations(user_id, updated_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation ON chat_messages(conversation_id)",
            [],
        )?;

        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    fn load_turns(conn: &Connection, conversation_id: &str) -> Result<Vec<Turn>> {
        let mut stmt = conn.prepare(
            "SELECT id, role, content, attachments_json, created_at
             FROM chat_messages
             WHERE conversation_id = ?1
             ORDER BY rowid ASC",
        )?;

        let turns = stmt
            .query_map([conversation_id], |row| {
                let role: String = row.get(1)?;
                let attachments_json: String = row.get(3)?;
                let attachments: Vec<AttachmentMeta> = serde_json::from_str(&attachments_json)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                Ok(Turn {
                    id: row.get(0)?,
                    role: Role::parse(&role).unwrap_or(Role::System),
                    content: row.get(2)?,
                    attachments,
                    timestamp: parse_timestamp(row.get(4)?, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(turns)
    }

    fn load_conversation_row(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Option<Conversation>> {
        let row = conn
            .query_row(
                "SELECT id, user_id, title, created_at, updated_at
                 FROM chat_conversations WHERE id = ?1",
                [conversation_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        title: row.get(2)?,
                        messages: Vec::new(),
                        created_at: parse_timestamp(row.get(3)?, 3)?,
                        updated_at: parse_timestamp(row.get(4)?, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_chat_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chat_conversations (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id,
                conversation.user_id,
                conversation.title,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;
        for turn in &conversation.messages {
            Self::insert_turn(&tx, &conversation.id, turn)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_turn(conn: &Connection, conversation_id: &str, turn: &Turn) -> Result<()> {
        let attachments_json = serde_json::to_string(&turn.attachments)?;
        conn.execute(
            "INSERT INTO chat_messages (id, conversation_id, role, content, attachments_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.id,
                conversation_id,
                turn.role.as_str(),
                turn.content,
                attachments_json,
                turn.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_chat_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        let Some(mut conversation) = Self::load_conversation_row(&conn, conversation_id)? else {
            return Ok(None);
        };
        conversation.messages = Self::load_turns(&conn, conversation_id)?;
        Ok(Some(conversation))
    }

    pub fn list_chat_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM chat_conversations
             WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![user_id, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut conversation) = Self::load_conversation_row(&conn, &id)? {
                conversation.messages = Self::load_turns(&conn, &id)?;
                conversations.push(conversation);
            }
        }
        Ok(conversations)
    }

    pub fn append_chat_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE chat_conversations SET updated_at = ?1 WHERE id = ?2",
            params![turn.timestamp.to_rfc3339(), conversation_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("conversation '{}' not found", conversation_id));
        }
        Self::insert_turn(&tx, conversation_id, turn)?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_chat_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE chat_conversations SET title = ?1 WHERE id = ?2",
            params![title, conversation_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("conversation '{}' not found", conversation_id));
        }
        Ok(())
    }

    /// Removes the conversation and its turns in one transaction.
    pub fn delete_chat_conversation(&self, conversation_id: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chat_messages WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        let removed = tx.execute(
            "DELETE FROM chat_conversations WHERE id = ?1",
            [conversation_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
        let role: String = row.get(3)?;
        Ok(UserRecord {
            user: User {
                id: row.get(0)?,
                email: row.get(1)?,
                name: row.get(2)?,
                role: UserRole::from_db(&role),
                created_at: parse_timestamp(row.get(6)?, 6)?,
            },
            password_salt: row.get(4)?,
            password_hash: row.get(5)?,
        })
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let conn = self.lock_conn()?;
        let user = conn
            .query_row(
                "SELECT id, email, name, role, password_salt, password_hash, created_at
                 FROM users WHERE email = ?1 COLLATE NOCASE",
                [email.trim()],
                Self::map_user_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let conn = self.lock_conn()?;
        let user = conn
            .query_row(
                "SELECT id, email, name, role, password_salt, password_hash, created_at
                 FROM users WHERE id = ?1",
                [user_id],
                Self::map_user_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn create_user(&self, record: &UserRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO users (id, email, name, role, password_salt, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.user.id,
                record.user.email,
                record.user.name,
                record.user.role.as_str(),
                record.password_salt,
                record.password_hash,
                record.user.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to create user")?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, name, role, password_salt, password_hash, created_at
             FROM users ORDER BY created_at ASC",
        )?;
        let users = stmt
            .query_map([], Self::map_user_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn create_session(&self, token: &str, user_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn session_user_id(&self, token: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let user_id = conn
            .query_row(
                "SELECT user_id FROM sessions WHERE token = ?1",
                [token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for GaodDatabase {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_setting(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_setting(key, value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_setting(key)
    }
}

#[async_trait]
impl ConversationStore for GaodDatabase {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.create_chat_conversation(conversation)
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.get_chat_conversation(conversation_id)
    }

    async fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<Conversation>> {
        self.list_chat_conversations(user_id, limit)
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()> {
        self.append_chat_turn(conversation_id, turn)
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.set_chat_title(conversation_id, title)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        self.delete_chat_conversation(conversation_id)
    }
}

#[async_trait]
impl UserStore for GaodDatabase {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        GaodDatabase::find_user_by_email(self, email)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        GaodDatabase::get_user(self, user_id)
    }

    async fn create_user(&self, user: &UserRecord) -> Result<()> {
        GaodDatabase::create_user(self, user)
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        GaodDatabase::list_users(self)
    }

    async fn create_session(&self, token: &str, user_id: &str) -> Result<()> {
        GaodDatabase::create_session(self, token, user_id)
    }

    async fn session_user_id(&self, token: &str) -> Result<Option<String>> {
        GaodDatabase::session_user_id(self, token)
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        GaodDatabase::delete_session(self, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, GaodDatabase) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = GaodDatabase::new(dir.path().join("gaod_test.db")).expect("db init");
        (dir, db)
    }

    #[test]
    fn settings_overwrite_and_delete() {
        let (_dir, db) = temp_db();
        assert_eq!(db.get_setting("gaod_openai_key").unwrap(), None);
        db.set_setting("gaod_openai_key", "one").unwrap();
        db.set_setting("gaod_openai_key", "two").unwrap();
        assert_eq!(db.get_setting("gaod_openai_key").unwrap().as_deref(), Some("two"));
        db.delete_setting("gaod_openai_key").unwrap();
        assert_eq!(db.get_setting("gaod_openai_key").unwrap(), None);
    }

    #[test]
    fn conversation_turns_round_trip_in_order() {
        let (_dir, db) = temp_db();
        let conversation = Conversation::new("user-1");
        db.create_chat_conversation(&conversation).unwrap();

        let with_file = Turn::new(Role::User, "look at this").with_attachments(vec![AttachmentMeta {
            name: "notes.txt".to_string(),
            size: 12,
            mime_type: "text/plain".to_string(),
        }]);
        db.append_chat_turn(&conversation.id, &with_file).unwrap();
        db.append_chat_turn(&conversation.id, &Turn::new(Role::Assistant, "seen it"))
            .unwrap();
        db.set_chat_title(&conversation.id, "look at this").unwrap();

        let loaded = db.get_chat_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(loaded.title, "look at this");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].attachments[0].name, "notes.txt");
        assert_eq!(loaded.messages[1].role, Role::Assistant);

        let listed = db.list_chat_conversations("user-1", 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(db.list_chat_conversations("user-2", 10).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_conversation_and_turns() {
        let (_dir, db) = temp_db();
        let conversation = Conversation::new("user-1");
        db.create_chat_conversation(&conversation).unwrap();
        db.append_chat_turn(&conversation.id, &Turn::new(Role::User, "hi"))
            .unwrap();

        assert!(db.delete_chat_conversation(&conversation.id).unwrap());
        assert!(db.get_chat_conversation(&conversation.id).unwrap().is_none());
        assert!(!db.delete_chat_conversation(&conversation.id).unwrap());

        let conn = db.lock_conn().unwrap();
        let orphaned: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE conversation_id = ?1",
                [&conversation.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphaned, 0);
    }

    #[test]
    fn append_to_missing_conversation_fails() {
        let (_dir, db) = temp_db();
        assert!(db
            .append_chat_turn("missing", &Turn::new(Role::User, "hi"))
            .is_err());
    }

    #[test]
    fn users_and_sessions_persist() {
        let (_dir, db) = temp_db();
        let record = UserRecord::new("Admin@Example.com", "Admin", "pw", UserRole::Admin);
        db.create_user(&record).unwrap();
        assert!(db
            .create_user(&UserRecord::new("admin@example.com", "Dup", "pw", UserRole::User))
            .is_err());

        let found = db.find_user_by_email("admin@example.com").unwrap().unwrap();
        assert_eq!(found, record);

        db.create_session("tok", &record.user.id).unwrap();
        assert_eq!(
            db.session_user_id("tok").unwrap().as_deref(),
            Some(record.user.id.as_str())
        );
        db.delete_session("tok").unwrap();
        assert_eq!(db.session_user_id("tok").unwrap(), None);
    }
}
