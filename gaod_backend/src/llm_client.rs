use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ProviderUrls;
use crate::store::SettingsStore;

pub const CUSTOM_MODELS_KEY: &str = "gaod_custom_models";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "google" | "gemini" => Some(Provider::Google),
            _ => None,
        }
    }

    /// Settings key holding this provider's credential.
    pub fn api_key_setting(self) -> &'static str {
        match self {
            Provider::OpenAi => "gaod_openai_key",
            Provider::Anthropic => "gaod_anthropic_key",
            Provider::Google => "gaod_google_key",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub id: String,
    pub provider: Provider,
}

/// Parse the stored model catalog. Entries with an unknown provider or a
/// missing field are skipped; extra fields are ignored.
pub fn parse_model_catalog(raw: &str) -> Vec<ModelDescriptor> {
    let entries = match serde_json::from_str::<Vec<Value>>(raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Ignoring malformed {}: {}", CUSTOM_MODELS_KEY, e);
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<ModelDescriptor>(entry) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::debug!("Skipping model catalog entry: {}", e);
                None
            }
        })
        .collect()
}

/// Configured models, or just the default model when the catalog is empty.
pub async fn load_model_catalog(
    settings: &dyn SettingsStore,
    default_model: &ModelDescriptor,
) -> Result<Vec<ModelDescriptor>> {
    let stored = settings
        .get(CUSTOM_MODELS_KEY)
        .await
        .context("Failed to read model catalog")?;
    let models = stored.as_deref().map(parse_model_catalog).unwrap_or_default();
    if models.is_empty() {
        Ok(vec![default_model.clone()])
    } else {
        Ok(models)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Everything one generation call needs: target model, composed system
/// prompt, and the conversation tail ending with the new user input.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: ModelDescriptor,
    pub system_prompt: String,
    pub messages: Vec<Message>,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Streaming variant. Providers without incremental output send the whole
    /// text as one chunk.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        chunks: &flume::Sender<String>,
    ) -> Result<String> {
        let text = self.generate(request).await?;
        let _ = chunks.send(text.clone());
        Ok(text)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    content: Option<GoogleContent>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: Option<String>,
}

/// Talks to the three hosted chat providers. Credentials are read from the
/// settings store on every call so admin edits apply to the next turn.
#[derive(Clone)]
pub struct LlmClient {
    urls: ProviderUrls,
    settings: Arc<dyn SettingsStore>,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(urls: ProviderUrls, settings: Arc<dyn SettingsStore>, client: reqwest::Client) -> Self {
        Self {
            urls,
            settings,
            client,
        }
    }

    async fn api_key(&self, provider: Provider) -> Result<String> {
        let key = self
            .settings
            .get(provider.api_key_setting())
            .await
            .context("Failed to read provider credential")?
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        key.ok_or_else(|| anyhow::anyhow!("No API key configured for provider {}", provider))
    }

    async fn read_success(response: reqwest::Response, label: &str) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("{} API returned error {}: {}", label, status, body);
        }
        Ok(response)
    }

    async fn generate_openai(&self, request: &GenerationRequest, api_key: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.urls.openai.trim_end_matches('/'));

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(Message {
                role: "system".to_string(),
                content: request.system_prompt.clone(),
            });
        }
        messages.extend(request.messages.iter().cloned());

        let body = ChatCompletionRequest {
            model: &request.model.id,
            messages,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send OpenAI request")?;
        let response = Self::read_success(response, "OpenAI").await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse OpenAI response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI"))
    }

    async fn generate_anthropic(&self, request: &GenerationRequest, api_key: &str) -> Result<String> {
        let url = format!("{}/messages", self.urls.anthropic.trim_end_matches('/'));

        let body = AnthropicRequest {
            model: &request.model.id,
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system: &request.system_prompt,
            messages: &request.messages,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send Anthropic request")?;
        let response = Self::read_success(response, "Anthropic").await?;

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse Anthropic response")?;

        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow::anyhow!("No response from Anthropic"))
    }

    async fn generate_google(&self, request: &GenerationRequest, api_key: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.urls.google.trim_end_matches('/'),
            request.model.id
        );

        let contents: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({ "contents": contents });
        if !request.system_prompt.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.system_prompt }] });
        }

        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send Google request")?;
        let response = Self::read_success(response, "Google").await?;

        let parsed: GoogleResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse Google response")?;

        parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| anyhow::anyhow!("No response from Google"))
    }
}

#[async_trait]
impl GenerationClient for LlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let provider = request.model.provider;
        let api_key = self.api_key(provider).await?;
        tracing::debug!(
            "Generating with {} model {} ({} messages)",
            provider,
            request.model.id,
            request.messages.len()
        );

        match provider {
            Provider::OpenAi => self.generate_openai(request, &api_key).await,
            Provider::Anthropic => self.generate_anthropic(request, &api_key).await,
            Provider::Google => self.generate_google(request, &api_key).await,
        }
    }
}
