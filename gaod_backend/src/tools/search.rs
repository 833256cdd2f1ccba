use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::SettingsStore;

pub const SEARCH_KEY_SETTING: &str = "gaod_search_key";
pub const SEARCH_CX_SETTING: &str = "gaod_search_cx";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// Numbered markdown list of the top `limit` results.
pub fn format_results(query: &str, results: &[SearchResult], limit: usize) -> String {
    if results.is_empty() {
        return format!("No search results found for \"{}\".", query);
    }

    let mut out = format!("**Search results for \"{}\":**", query);
    for (index, result) in results.iter().take(limit).enumerate() {
        out.push_str(&format!("\n{}. [{}]({})", index + 1, result.title, result.link));
        let snippet = result.snippet.split_whitespace().collect::<Vec<_>>().join(" ");
        if !snippet.is_empty() {
            out.push_str(" - ");
            out.push_str(&snippet);
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct CustomSearchResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

/// Google Programmable Search (Custom Search JSON API).
pub struct GoogleSearchClient {
    endpoint: String,
    settings: Arc<dyn SettingsStore>,
    client: reqwest::Client,
}

impl GoogleSearchClient {
    pub fn new(endpoint: String, settings: Arc<dyn SettingsStore>, client: reqwest::Client) -> Self {
        Self {
            endpoint,
            settings,
            client,
        }
    }

    async fn credentials(&self) -> Result<(String, String)> {
        let key = self.settings.get(SEARCH_KEY_SETTING).await?.unwrap_or_default();
        let cx = self.settings.get(SEARCH_CX_SETTING).await?.unwrap_or_default();
        if key.trim().is_empty() || cx.trim().is_empty() {
            anyhow::bail!("Search API key or engine id not configured");
        }
        Ok((key.trim().to_string(), cx.trim().to_string()))
    }
}

#[async_trait]
impl SearchClient for GoogleSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let (key, cx) = self.credentials().await?;

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("key", key.as_str()), ("cx", cx.as_str()), ("q", query)])
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Search API returned error {}: {}", status, body);
        }

        let parsed: CustomSearchResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse search response")?;
        tracing::debug!("Search for {:?} returned {} items", query, parsed.items.len());
        Ok(parsed.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn configured_client(server: &MockServer) -> GoogleSearchClient {
        let settings = Arc::new(InMemoryStore::new());
        settings.set(SEARCH_KEY_SETTING, "test-search-key").await.unwrap();
        settings.set(SEARCH_CX_SETTING, "test-cx").await.unwrap();
        GoogleSearchClient::new(server.uri(), settings, reqwest::Client::new())
    }

    #[tokio::test]
    async fn sends_key_cx_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "test-search-key"))
            .and(query_param("cx", "test-cx"))
            .and(query_param("q", "OpenAI"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"title": "Real API Mock Result", "link": "http://example.com", "snippet": "This proves the fetch ran."}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let results = configured_client(&server).await.search("OpenAI").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Real API Mock Result");
    }

    #[tokio::test]
    async fn missing_items_is_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "customsearch#search"})))
            .mount(&server)
            .await;

        let results = configured_client(&server).await.search("nothing").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_credentials_fail_without_request() {
        let server = MockServer::start().await;
        let client =
            GoogleSearchClient::new(server.uri(), Arc::new(InMemoryStore::new()), reqwest::Client::new());
        assert!(client.search("q").await.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("quota"))
            .mount(&server)
            .await;

        let err = configured_client(&server).await.search("q").await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn formats_numbered_list_capped_at_limit() {
        let results: Vec<SearchResult> = (1..=5)
            .map(|i| SearchResult {
                title: format!("Title {}", i),
                link: format!("https://example.com/{}", i),
                snippet: format!("Snippet\n{}", i),
            })
            .collect();
        let text = format_results("rust", &results, 3);
        assert_eq!(
            text,
            "**Search results for \"rust\":**\n\
             1. [Title 1](https://example.com/1) - Snippet 1\n\
             2. [Title 2](https://example.com/2) - Snippet 2\n\
             3. [Title 3](https://example.com/3) - Snippet 3"
        );
        assert_eq!(format_results("x", &[], 3), "No search results found for \"x\".");
    }
}
