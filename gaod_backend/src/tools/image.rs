use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ImageConfig;
use crate::llm_client::Provider;
use crate::store::SettingsStore;

#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Returns a URL or a `data:` URI for the generated asset.
    async fn generate_image(&self, prompt: &str) -> Result<String>;
}

/// Markdown image reference used in place of a `GENERATE_IMAGE` tag.
pub fn image_markdown(prompt: &str, asset: &str) -> String {
    let alt: String = prompt
        .chars()
        .map(|c| if matches!(c, '[' | ']') { ' ' } else { c })
        .collect();
    format!("![{}]({})", alt.trim(), asset)
}

#[derive(Debug, Serialize)]
struct ImageGenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

/// OpenAI `images/generations`, authenticated with the OpenAI chat key.
pub struct OpenAiImageClient {
    api_url: String,
    image: ImageConfig,
    settings: Arc<dyn SettingsStore>,
    client: reqwest::Client,
}

impl OpenAiImageClient {
    pub fn new(
        api_url: String,
        image: ImageConfig,
        settings: Arc<dyn SettingsStore>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_url,
            image,
            settings,
            client,
        }
    }
}

#[async_trait]
impl ImageClient for OpenAiImageClient {
    async fn generate_image(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .settings
            .get(Provider::OpenAi.api_key_setting())
            .await?
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No OpenAI API key configured for image generation"))?;

        let url = format!("{}/images/generations", self.api_url.trim_end_matches('/'));
        let request = ImageGenerationRequest {
            model: &self.image.model,
            prompt,
            n: 1,
            size: &self.image.size,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key.trim())
            .json(&request)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send image request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Image API returned error {}: {}", status, body);
        }

        let parsed: ImageGenerationResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse image response")?;

        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Image API returned no images"))?;
        match (first.url, first.b64_json) {
            (Some(url), _) => Ok(url),
            (None, Some(b64)) => Ok(format!("data:image/png;base64,{}", b64)),
            (None, None) => anyhow::bail!("Image API returned neither url nor data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_with_key(server: &MockServer, key: Option<&str>) -> OpenAiImageClient {
        let settings = Arc::new(InMemoryStore::new());
        if let Some(key) = key {
            settings.set("gaod_openai_key", key).await.unwrap();
        }
        OpenAiImageClient::new(
            server.uri(),
            ImageConfig::default(),
            settings,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn returns_first_image_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(header("authorization", "Bearer sk-img"))
            .and(body_partial_json(json!({
                "model": "dall-e-3",
                "prompt": "a red fox",
                "n": 1,
                "size": "1024x1024"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"url": "https://images.example.com/fox.png"}]
            })))
            .mount(&server)
            .await;

        let client = client_with_key(&server, Some("sk-img")).await;
        let url = client.generate_image("a red fox").await.unwrap();
        assert_eq!(url, "https://images.example.com/fox.png");
    }

    #[tokio::test]
    async fn falls_back_to_data_uri() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"b64_json": "AAAA"}]
            })))
            .mount(&server)
            .await;

        let client = client_with_key(&server, Some("sk-img")).await;
        assert_eq!(
            client.generate_image("x").await.unwrap(),
            "data:image/png;base64,AAAA"
        );
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let server = MockServer::start().await;
        let client = client_with_key(&server, None).await;
        assert!(client.generate_image("x").await.is_err());
    }

    #[test]
    fn markdown_strips_brackets_from_alt_text() {
        assert_eq!(
            image_markdown("a [neon] cat", "https://x/cat.png"),
            "![a  neon  cat](https://x/cat.png)"
        );
    }
}
