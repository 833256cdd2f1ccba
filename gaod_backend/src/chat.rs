//! Chat turn orchestration.
//!
//! One call to [`ChatService::send_message`] runs a whole turn:
//! validate, claim the conversation, spend quota, store the user turn, build
//! the prompt, generate, resolve tool tags, and store the assistant turn.
//! Progress is published as [`ChatEvent`]s on a flume channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::auth::User;
use crate::config::GaodConfig;
use crate::llm_client::{load_model_catalog, GenerationClient, GenerationRequest, ModelDescriptor};
use crate::memory::UserMemory;
use crate::prompt::{build_messages, build_system_prompt, SYSTEM_PROMPT_KEY};
use crate::rate_limit::{RateLimiter, CHAT_ACTION};
use crate::security;
use crate::store::{
    derive_title, AttachmentMeta, Conversation, ConversationStore, Role, SettingsStore, Turn,
};
use crate::tools::image::ImageClient;
use crate::tools::search::SearchClient;
use crate::tools::{EffectRecord, TagPostProcessor};

const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    TurnStarted {
        user_id: String,
        conversation_id: String,
        user_turn_id: String,
    },
    TurnChunk {
        user_id: String,
        conversation_id: String,
        content: String,
    },
    TurnCompleted {
        user_id: String,
        conversation_id: String,
        assistant_turn_id: String,
        effects: usize,
    },
    TurnFailed {
        user_id: String,
        conversation_id: String,
        error: String,
    },
    TurnRejected {
        user_id: String,
        conversation_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
    pub model_id: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Input failed validation; nothing was stored.
    Validation,
    /// Another turn for this conversation is still running; nothing was stored.
    Busy,
    /// Quota exhausted; only a local notice turn was stored.
    Quota,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed {
        user_turn: Turn,
        assistant_turn: Turn,
        effects: Vec<EffectRecord>,
    },
    /// Generation, prompt assembly or storage failed; `assistant_turn` holds
    /// the placeholder, stored when the store accepts it.
    Failed {
        user_turn: Turn,
        assistant_turn: Turn,
        error: String,
    },
    Rejected {
        kind: RejectionKind,
        reason: String,
        notice: Option<Turn>,
    },
}

/// Content as stored for the user turn, including the attachment note.
pub fn content_with_attachment_note(content: &str, attachments: &[AttachmentMeta]) -> String {
    if attachments.is_empty() {
        return content.to_string();
    }
    let names: Vec<&str> = attachments.iter().map(|a| a.name.as_str()).collect();
    format!(
        "{}\n\n[Attached {} file(s): {}]",
        content,
        attachments.len(),
        names.join(", ")
    )
}

fn short_error(error: &str) -> String {
    let redacted = security::redact_text(error);
    let first_line = redacted.lines().next().unwrap_or_default();
    let mut short: String = first_line.chars().take(MAX_ERROR_CHARS).collect();
    if first_line.chars().count() > MAX_ERROR_CHARS {
        short.push_str("...");
    }
    short
}

/// Marks a conversation as having a turn in flight until dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    conversation_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.conversation_id);
    }
}

pub struct ChatService {
    conversations: Arc<dyn ConversationStore>,
    settings: Arc<dyn SettingsStore>,
    memory: UserMemory,
    generator: Arc<dyn GenerationClient>,
    post_processor: TagPostProcessor,
    rate_limiter: RateLimiter,
    default_model: ModelDescriptor,
    history_window: usize,
    title_length: usize,
    max_message_length: usize,
    event_tx: flume::Sender<ChatEvent>,
    in_flight: Mutex<HashSet<String>>,
}

impl ChatService {
    pub fn new(
        config: &GaodConfig,
        conversations: Arc<dyn ConversationStore>,
        settings: Arc<dyn SettingsStore>,
        generator: Arc<dyn GenerationClient>,
        search: Arc<dyn SearchClient>,
        image: Arc<dyn ImageClient>,
        event_tx: flume::Sender<ChatEvent>,
    ) -> Self {
        let memory = UserMemory::new(settings.clone());
        let post_processor =
            TagPostProcessor::new(memory.clone(), search, image, config.search_results);
        Self {
            conversations,
            settings,
            memory,
            generator,
            post_processor,
            rate_limiter: RateLimiter::new(config.rate_limit, config.rate_window_secs),
            default_model: config.default_model.clone(),
            history_window: config.history_window,
            title_length: config.title_length,
            max_message_length: config.max_message_length,
            event_tx,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn memory(&self) -> &UserMemory {
        &self.memory
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    fn try_begin_turn(&self, conversation_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(conversation_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            conversation_id: conversation_id.to_string(),
        })
    }

    pub async fn create_conversation(&self, user: &User) -> Result<Conversation> {
        let conversation = Conversation::new(&user.id);
        self.conversations
            .create_conversation(&conversation)
            .await
            .context("Failed to create conversation")?;
        tracing::info!("Created conversation {} for user {}", conversation.id, user.id);
        Ok(conversation)
    }

    pub async fn list_conversations(&self, user: &User, limit: usize) -> Result<Vec<Conversation>> {
        self.conversations.list_conversations(&user.id, limit).await
    }

    /// The conversation if it exists and belongs to `user`.
    pub async fn get_conversation(
        &self,
        user: &User,
        conversation_id: &str,
    ) -> Result<Option<Conversation>> {
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Ok(conversation.filter(|c| c.user_id == user.id))
    }

    /// Delete an owned conversation with all of its turns. Returns false when
    /// there is nothing the user may delete.
    pub async fn delete_conversation(&self, user: &User, conversation_id: &str) -> Result<bool> {
        if self.get_conversation(user, conversation_id).await?.is_none() {
            return Ok(false);
        }
        let deleted = self
            .conversations
            .delete_conversation(conversation_id)
            .await
            .context("Failed to delete conversation")?;
        if deleted {
            tracing::info!("Deleted conversation {}", conversation_id);
        }
        Ok(deleted)
    }

    pub async fn send_message(&self, user: &User, request: SendMessageRequest) -> Result<TurnOutcome> {
        let conversation_id = request.conversation_id.as_str();

        let report = security::validate_message(&request.content, "user", self.max_message_length);
        if !report.is_valid() {
            return Ok(self.reject(
                &user.id,
                conversation_id,
                RejectionKind::Validation,
                report.summary(),
                None,
            ));
        }

        let Some(_guard) = self.try_begin_turn(conversation_id) else {
            return Ok(self.reject(
                &user.id,
                conversation_id,
                RejectionKind::Busy,
                "A response is still being generated for this conversation.".to_string(),
                None,
            ));
        };

        let conversation = match self.get_conversation(user, conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return Err(anyhow!("conversation '{}' not found", conversation_id)),
            Err(error) => {
                let message = format!("{:#}", error);
                security::log_failure(
                    "chat.load",
                    &message,
                    &json!({ "user_id": user.id, "conversation_id": conversation_id }),
                );
                self.emit(ChatEvent::TurnFailed {
                    user_id: user.id.clone(),
                    conversation_id: conversation_id.to_string(),
                    error: short_error(&message),
                });
                return Err(error.context("Failed to load conversation"));
            }
        };

        let quota = self.rate_limiter.check(&user.id, CHAT_ACTION);
        if !quota.allowed {
            let wait_secs = (quota.reset_at - chrono::Utc::now()).num_seconds().max(1);
            let reason = format!(
                "Rate limit exceeded. Please wait {} seconds before sending another message.",
                wait_secs
            );
            let notice = Turn::new(Role::System, reason.clone());
            self.conversations
                .append_turn(conversation_id, &notice)
                .await
                .context("Failed to store rate limit notice")?;
            tracing::warn!("User {} hit the chat rate limit", user.id);
            return Ok(self.reject(
                &user.id,
                conversation_id,
                RejectionKind::Quota,
                reason,
                Some(notice),
            ));
        }

        let user_content = content_with_attachment_note(&request.content, &request.attachments);
        let user_turn =
            Turn::new(Role::User, user_content.clone()).with_attachments(request.attachments.clone());
        if let Err(error) = self.store_user_turn(&conversation, &user_turn, &request.content).await {
            return Ok(self.fail_turn("chat.store", user, &request, user_turn, error).await);
        }

        self.emit(ChatEvent::TurnStarted {
            user_id: user.id.clone(),
            conversation_id: conversation_id.to_string(),
            user_turn_id: user_turn.id.clone(),
        });

        let generated = self
            .generate_reply(user, &conversation, request.model_id.as_deref(), &user_content)
            .await;

        let raw_text = match generated {
            Ok(text) => text,
            Err(error) => {
                return Ok(self.fail_turn("chat.generate", user, &request, user_turn, error).await);
            }
        };

        let processed = self.post_processor.process(&user.id, &raw_text).await;
        let assistant_turn = Turn::new(Role::Assistant, processed.clean_text);
        if let Err(error) = self
            .conversations
            .append_turn(conversation_id, &assistant_turn)
            .await
        {
            let error = error.context("Failed to store assistant turn");
            return Ok(self.fail_turn("chat.store", user, &request, user_turn, error).await);
        }

        self.emit(ChatEvent::TurnCompleted {
            user_id: user.id.clone(),
            conversation_id: conversation_id.to_string(),
            assistant_turn_id: assistant_turn.id.clone(),
            effects: processed.effects.len(),
        });

        Ok(TurnOutcome::Completed {
            user_turn,
            assistant_turn,
            effects: processed.effects,
        })
    }

    async fn store_user_turn(
        &self,
        conversation: &Conversation,
        user_turn: &Turn,
        content: &str,
    ) -> Result<()> {
        self.conversations
            .append_turn(&conversation.id, user_turn)
            .await
            .context("Failed to store user turn")?;
        if !conversation.has_user_turn() {
            let title = derive_title(content, self.title_length);
            self.conversations
                .set_title(&conversation.id, &title)
                .await
                .context("Failed to set conversation title")?;
        }
        Ok(())
    }

    /// Log a turn-fatal error, store a best-effort `[Error: ...]` reply in
    /// place of the assistant turn and publish `TurnFailed`.
    async fn fail_turn(
        &self,
        context: &str,
        user: &User,
        request: &SendMessageRequest,
        user_turn: Turn,
        error: anyhow::Error,
    ) -> TurnOutcome {
        let message = format!("{:#}", error);
        let reason = short_error(&message);
        security::log_failure(
            context,
            &message,
            &json!({
                "user_id": user.id,
                "conversation_id": request.conversation_id,
                "model_id": request.model_id,
            }),
        );

        let assistant_turn = Turn::new(Role::Assistant, format!("[Error: {}]", reason));
        if let Err(store_error) = self
            .conversations
            .append_turn(&request.conversation_id, &assistant_turn)
            .await
        {
            tracing::warn!(
                "Failed to store error turn: {}",
                security::redact_text(&format!("{:#}", store_error))
            );
        }

        self.emit(ChatEvent::TurnFailed {
            user_id: user.id.clone(),
            conversation_id: request.conversation_id.clone(),
            error: reason.clone(),
        });
        TurnOutcome::Failed {
            user_turn,
            assistant_turn,
            error: reason,
        }
    }

    fn reject(
        &self,
        user_id: &str,
        conversation_id: &str,
        kind: RejectionKind,
        reason: String,
        notice: Option<Turn>,
    ) -> TurnOutcome {
        self.emit(ChatEvent::TurnRejected {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            reason: reason.clone(),
        });
        TurnOutcome::Rejected {
            kind,
            reason,
            notice,
        }
    }

    async fn resolve_model(&self, model_id: Option<&str>) -> Result<ModelDescriptor> {
        let catalog = load_model_catalog(self.settings.as_ref(), &self.default_model).await?;
        let Some(model_id) = model_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(catalog
                .into_iter()
                .next()
                .unwrap_or_else(|| self.default_model.clone()));
        };
        if let Some(model) = catalog.iter().find(|m| m.id == model_id) {
            return Ok(model.clone());
        }
        if self.default_model.id == model_id {
            return Ok(self.default_model.clone());
        }
        Err(anyhow!("Unknown model '{}'", model_id))
    }

    /// Prompt assembly plus generation. Any failure here is turn-fatal.
    async fn generate_reply(
        &self,
        user: &User,
        conversation: &Conversation,
        model_id: Option<&str>,
        user_content: &str,
    ) -> Result<String> {
        let model = self.resolve_model(model_id).await?;
        let persona = self
            .settings
            .get(SYSTEM_PROMPT_KEY)
            .await
            .context("Failed to read system prompt")?;
        let memory_block = self.memory.prompt_block(&user.id).await?;

        let request = GenerationRequest {
            model,
            system_prompt: build_system_prompt(persona.as_deref(), &memory_block),
            messages: build_messages(&conversation.messages, self.history_window, user_content),
        };

        let (chunk_tx, chunk_rx) = flume::unbounded::<String>();
        let request_ref = &request;
        let generate = async move {
            let result = self.generator.generate_stream(request_ref, &chunk_tx).await;
            drop(chunk_tx);
            result
        };
        let forward = async {
            while let Ok(content) = chunk_rx.recv_async().await {
                self.emit(ChatEvent::TurnChunk {
                    user_id: user.id.clone(),
                    conversation_id: conversation.id.clone(),
                    content,
                });
            }
        };
        let (result, ()) = tokio::join!(generate, forward);
        result
    }
}
