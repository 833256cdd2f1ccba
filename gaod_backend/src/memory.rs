//! Per-user long-term memory: one free-text blob of `- fact` lines kept in
//! the settings store under `gaod_user_memory_<user id>`.
//!
//! Appends are read-modify-write with no versioning, so two concurrent
//! appends for the same user can race and the last write wins.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::store::SettingsStore;

pub const EMPTY_MEMORY_PLACEHOLDER: &str = "No previous memory.";

pub fn memory_key(user_id: &str) -> String {
    format!("gaod_user_memory_{}", user_id)
}

#[derive(Clone)]
pub struct UserMemory {
    settings: Arc<dyn SettingsStore>,
}

impl UserMemory {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    pub async fn read(&self, user_id: &str) -> Result<String> {
        let blob = self
            .settings
            .get(&memory_key(user_id))
            .await
            .context("Failed to read user memory")?;
        Ok(blob.unwrap_or_default())
    }

    /// Append `- <fact>` as a new line and return the updated blob.
    pub async fn append_fact(&self, user_id: &str, fact: &str) -> Result<String> {
        let current = self.read(user_id).await?;
        let mut updated = current;
        if !updated.is_empty() {
            updated.push('\n');
        }
        updated.push_str("- ");
        updated.push_str(fact);

        self.settings
            .set(&memory_key(user_id), &updated)
            .await
            .context("Failed to write user memory")?;
        tracing::debug!("Memory for user {} now has {} lines", user_id, updated.lines().count());
        Ok(updated)
    }

    pub async fn clear(&self, user_id: &str) -> Result<()> {
        self.settings
            .delete(&memory_key(user_id))
            .await
            .context("Failed to clear user memory")
    }

    /// Memory text as injected into the prompt.
    pub async fn prompt_block(&self, user_id: &str) -> Result<String> {
        let blob = self.read(user_id).await?;
        if blob.trim().is_empty() {
            Ok(EMPTY_MEMORY_PLACEHOLDER.to_string())
        } else {
            Ok(blob)
        }
    }
}
