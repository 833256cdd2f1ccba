//! In-band tool tags and the post-processor that resolves them.
//!
//! Generated replies may carry `[UPDATE_MEMORY: ...]`, `[EXECUTE_CODE: ...]`,
//! `[WEB_SEARCH: ...]` and `[GENERATE_IMAGE: ...]` tags. [`TagPostProcessor`]
//! runs one pass per kind in [`TagKind::PROCESSING_ORDER`]; each pass scans
//! the text produced by the previous pass once, left to right, performs each
//! side effect in turn, and splices in the replacement. Replacements are never
//! rescanned by the pass that produced them.
//!
//! Payloads end at the first `]`, so a payload cannot itself contain `]`.
//! A tag without its closing bracket is left in the text as-is.

pub mod code;
pub mod image;
pub mod search;

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use regex_lite::Regex;
use serde::Serialize;
use serde_json::json;

use crate::memory::UserMemory;
use crate::security;
use self::image::{image_markdown, ImageClient};
use self::search::{format_results, SearchClient};

const MAX_MARKER_REASON_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagKind {
    UpdateMemory,
    ExecuteCode,
    WebSearch,
    GenerateImage,
}

impl TagKind {
    /// Later passes operate on text already rewritten by earlier ones.
    pub const PROCESSING_ORDER: [TagKind; 4] = [
        TagKind::UpdateMemory,
        TagKind::ExecuteCode,
        TagKind::WebSearch,
        TagKind::GenerateImage,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            TagKind::UpdateMemory => "UPDATE_MEMORY",
            TagKind::ExecuteCode => "EXECUTE_CODE",
            TagKind::WebSearch => "WEB_SEARCH",
            TagKind::GenerateImage => "GENERATE_IMAGE",
        }
    }

    fn marker_label(self) -> &'static str {
        match self {
            TagKind::UpdateMemory => "Memory Error",
            TagKind::ExecuteCode => "Code Error",
            TagKind::WebSearch => "Search Error",
            TagKind::GenerateImage => "Image Error",
        }
    }

    fn pattern(self) -> Option<&'static Regex> {
        static PATTERNS: OnceLock<Vec<(TagKind, Regex)>> = OnceLock::new();
        PATTERNS
            .get_or_init(|| {
                TagKind::PROCESSING_ORDER
                    .iter()
                    .filter_map(|kind| {
                        let pattern = format!(r"\[{}:\s*(.*?)\]", kind.keyword());
                        Regex::new(&pattern).ok().map(|regex| (*kind, regex))
                    })
                    .collect()
            })
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, regex)| regex)
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One recognised tag with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    Memory(String),
    Code(String),
    Search(String),
    Image(String),
}

impl Tag {
    fn new(kind: TagKind, payload: String) -> Self {
        match kind {
            TagKind::UpdateMemory => Tag::Memory(payload),
            TagKind::ExecuteCode => Tag::Code(payload),
            TagKind::WebSearch => Tag::Search(payload),
            TagKind::GenerateImage => Tag::Image(payload),
        }
    }

    pub fn kind(&self) -> TagKind {
        match self {
            Tag::Memory(_) => TagKind::UpdateMemory,
            Tag::Code(_) => TagKind::ExecuteCode,
            Tag::Search(_) => TagKind::WebSearch,
            Tag::Image(_) => TagKind::GenerateImage,
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Tag::Memory(p) | Tag::Code(p) | Tag::Search(p) | Tag::Image(p) => p,
        }
    }
}

/// All non-overlapping tags of `kind` in `text`, left to right.
pub fn scan(text: &str, kind: TagKind) -> Vec<(Range<usize>, Tag)> {
    let Some(pattern) = kind.pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let payload = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            Some((whole.range(), Tag::new(kind, payload.trim_end().to_string())))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EffectOutcome {
    /// Side effect succeeded; `replacement` is what took the tag's place.
    Applied { replacement: String },
    /// Side effect failed; an inline marker took the tag's place.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectRecord {
    pub kind: TagKind,
    pub payload: String,
    pub outcome: EffectOutcome,
}

impl EffectRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, EffectOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessResult {
    pub clean_text: String,
    pub effects: Vec<EffectRecord>,
}

fn error_marker(kind: TagKind, reason: &str) -> String {
    let first_line = reason.lines().next().unwrap_or_default();
    let mut short: String = first_line.chars().take(MAX_MARKER_REASON_CHARS).collect();
    if first_line.chars().count() > MAX_MARKER_REASON_CHARS {
        short.push_str("...");
    }
    // Keep the marker itself a single well-formed bracket span
    let short = short.replace(['[', ']'], "");
    format!("[{}: {}]", kind.marker_label(), short.trim())
}

/// Resolves tool tags in generated text. Every collaborator is injected so the
/// processor can run against fakes.
#[derive(Clone)]
pub struct TagPostProcessor {
    memory: UserMemory,
    search: Arc<dyn SearchClient>,
    image: Arc<dyn ImageClient>,
    search_results: usize,
}

impl TagPostProcessor {
    pub fn new(
        memory: UserMemory,
        search: Arc<dyn SearchClient>,
        image: Arc<dyn ImageClient>,
        search_results: usize,
    ) -> Self {
        Self {
            memory,
            search,
            image,
            search_results,
        }
    }

    /// Resolve every tag in `raw_text` for `user_id`. Never fails: side-effect
    /// errors become inline markers and processing continues.
    pub async fn process(&self, user_id: &str, raw_text: &str) -> PostProcessResult {
        let mut text = raw_text.to_string();
        let mut effects = Vec::new();

        for kind in TagKind::PROCESSING_ORDER {
            let matches = scan(&text, kind);
            if matches.is_empty() {
                continue;
            }

            let mut rewritten = String::with_capacity(text.len());
            let mut cursor = 0;
            for (span, tag) in matches {
                rewritten.push_str(&text[cursor..span.start]);
                cursor = span.end;

                let (replacement, outcome) = match self.resolve(user_id, &tag).await {
                    Ok(replacement) => (
                        replacement.clone(),
                        EffectOutcome::Applied { replacement },
                    ),
                    Err(error) => {
                        let reason = security::redact_text(&error.to_string());
                        security::log_failure(
                            "tag_post_processor",
                            &reason,
                            &json!({
                                "kind": kind.keyword(),
                                "payload": tag.payload(),
                                "user_id": user_id,
                            }),
                        );
                        (error_marker(kind, &reason), EffectOutcome::Failed { reason })
                    }
                };

                rewritten.push_str(&replacement);
                effects.push(EffectRecord {
                    kind,
                    payload: tag.payload().to_string(),
                    outcome,
                });
            }
            rewritten.push_str(&text[cursor..]);
            text = rewritten;
        }

        PostProcessResult {
            clean_text: text.trim().to_string(),
            effects,
        }
    }

    async fn resolve(&self, user_id: &str, tag: &Tag) -> Result<String> {
        match tag {
            Tag::Memory(fact) => {
                if fact.trim().is_empty() {
                    bail!("empty memory fact");
                }
                self.memory.append_fact(user_id, fact.trim()).await?;
                Ok(String::new())
            }
            Tag::Code(expression) => {
                let result = code::evaluate_to_string(expression)?;
                Ok(format!("```output\n{}\n```", result))
            }
            Tag::Search(query) => {
                if query.trim().is_empty() {
                    bail!("empty search query");
                }
                let results = self.search.search(query.trim()).await?;
                Ok(format_results(query.trim(), &results, self.search_results))
            }
            Tag::Image(prompt) => {
                if prompt.trim().is_empty() {
                    bail!("empty image prompt");
                }
                let asset = self.image.generate_image(prompt.trim()).await?;
                Ok(image_markdown(prompt.trim(), &asset))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, SettingsStore};
    use async_trait::async_trait;
    use super::search::SearchResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSearch {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SearchClient for FakeSearch {
        async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("Search API returned error 403 Forbidden: quota");
            }
            Ok(vec![SearchResult {
                title: format!("About {}", query),
                link: "https://example.com".to_string(),
                snippet: "snippet".to_string(),
            }])
        }
    }

    #[derive(Default)]
    struct FakeImage {
        fail: bool,
    }

    #[async_trait]
    impl ImageClient for FakeImage {
        async fn generate_image(&self, _prompt: &str) -> Result<String> {
            if self.fail {
                bail!("No OpenAI API key configured for image generation");
            }
            Ok("https://images.example.com/1.png".to_string())
        }
    }

    struct BrokenSettings;

    #[async_trait]
    impl SettingsStore for BrokenSettings {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            bail!("storage offline")
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            bail!("storage offline")
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            bail!("storage offline")
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        search: Arc<FakeSearch>,
        processor: TagPostProcessor,
    }

    fn harness_with(search: FakeSearch, image: FakeImage) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let search = Arc::new(search);
        let processor = TagPostProcessor::new(
            UserMemory::new(store.clone()),
            search.clone(),
            Arc::new(image),
            3,
        );
        Harness {
            store,
            search,
            processor,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeSearch::default(), FakeImage::default())
    }

    async fn memory_of(store: &InMemoryStore, user: &str) -> Option<String> {
        store.get(&crate::memory::memory_key(user)).await.unwrap()
    }

    #[tokio::test]
    async fn untagged_text_is_trimmed_and_idempotent() {
        let h = harness();
        let first = h.processor.process("u1", "  Just a normal reply.\n").await;
        assert_eq!(first.clean_text, "Just a normal reply.");
        assert!(first.effects.is_empty());

        let second = h.processor.process("u1", &first.clean_text).await;
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn memory_tag_appends_fact_and_disappears() {
        let h = harness();
        h.store
            .set(&crate::memory::memory_key("u1"), "- Likes tea")
            .await
            .unwrap();

        let result = h
            .processor
            .process("u1", "Got it! [UPDATE_MEMORY: User's favorite color is blue]")
            .await;
        assert_eq!(result.clean_text, "Got it!");
        assert_eq!(
            memory_of(&h.store, "u1").await.as_deref(),
            Some("- Likes tea\n- User's favorite color is blue")
        );
        assert_eq!(result.effects.len(), 1);
        assert!(result.effects[0].succeeded());
    }

    #[tokio::test]
    async fn multiple_memory_tags_append_in_order() {
        let h = harness();
        let result = h
            .processor
            .process(
                "u1",
                "[UPDATE_MEMORY: first] Noted. [UPDATE_MEMORY:second][UPDATE_MEMORY:   third  ]",
            )
            .await;
        assert_eq!(result.clean_text, "Noted.");
        assert_eq!(
            memory_of(&h.store, "u1").await.as_deref(),
            Some("- first\n- second\n- third")
        );
        let payloads: Vec<&str> = result.effects.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn code_tag_is_replaced_with_output_block() {
        let h = harness();
        let result = h.processor.process("u1", "[EXECUTE_CODE: 10*10]").await;
        assert_eq!(result.clean_text, "```output\n100\n```");

        let result = h.processor.process("u1", "Sum: [EXECUTE_CODE: 2+2]").await;
        assert_eq!(result.clean_text, "Sum: ```output\n4\n```");
    }

    #[tokio::test]
    async fn invalid_code_becomes_marker() {
        let h = harness();
        let result = h
            .processor
            .process("u1", "Try [EXECUTE_CODE: fetch('x')] then [EXECUTE_CODE: 1+1]")
            .await;
        assert!(result.clean_text.starts_with("Try [Code Error: "));
        assert!(result.clean_text.ends_with("then ```output\n2\n```"));
        assert!(!result.effects[0].succeeded());
        assert!(result.effects[1].succeeded());
    }

    #[tokio::test]
    async fn unterminated_tag_is_left_untouched() {
        let h = harness();
        let raw = "Result: [EXECUTE_CODE: 2+2";
        let result = h.processor.process("u1", raw).await;
        assert_eq!(result.clean_text, raw);
        assert!(result.effects.is_empty());
    }

    #[tokio::test]
    async fn lowercase_keyword_is_not_a_tag() {
        let h = harness();
        let result = h.processor.process("u1", "[update_memory: nope]").await;
        assert_eq!(result.clean_text, "[update_memory: nope]");
        assert_eq!(memory_of(&h.store, "u1").await, None);
    }

    #[tokio::test]
    async fn search_and_image_are_substituted() {
        let h = harness();
        let result = h
            .processor
            .process("u1", "[WEB_SEARCH: rust]\n[GENERATE_IMAGE: a crab]")
            .await;
        assert_eq!(
            result.clean_text,
            "**Search results for \"rust\":**\n1. [About rust](https://example.com) - snippet\n\
             ![a crab](https://images.example.com/1.png)"
        );
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collaborator_failures_become_markers() {
        let h = harness_with(
            FakeSearch {
                fail: true,
                ..Default::default()
            },
            FakeImage { fail: true },
        );
        let result = h
            .processor
            .process("u1", "A [WEB_SEARCH: q] B [GENERATE_IMAGE: p] C")
            .await;
        assert_eq!(
            result.clean_text,
            "A [Search Error: Search API returned error 403 Forbidden: quota] B \
             [Image Error: No OpenAI API key configured for image generation] C"
        );
        assert!(result.effects.iter().all(|e| !e.succeeded()));
    }

    #[tokio::test]
    async fn memory_storage_failure_is_not_fatal() {
        let processor = TagPostProcessor::new(
            UserMemory::new(Arc::new(BrokenSettings)),
            Arc::new(FakeSearch::default()),
            Arc::new(FakeImage::default()),
            3,
        );
        let result = processor
            .process("u1", "Saved. [UPDATE_MEMORY: x] [EXECUTE_CODE: 3*3]")
            .await;
        assert!(result.clean_text.starts_with("Saved. [Memory Error: "));
        assert!(result.clean_text.ends_with("```output\n9\n```"));
    }

    #[tokio::test]
    async fn empty_payloads_are_rejected_inline() {
        let h = harness();
        let result = h
            .processor
            .process("u1", "[UPDATE_MEMORY: ] [WEB_SEARCH:  ]")
            .await;
        assert_eq!(
            result.clean_text,
            "[Memory Error: empty memory fact] [Search Error: empty search query]"
        );
        assert_eq!(memory_of(&h.store, "u1").await, None);
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn kinds_are_processed_in_fixed_order() {
        let h = harness();
        let result = h
            .processor
            .process("u1", "[GENERATE_IMAGE: x] [WEB_SEARCH: y] [EXECUTE_CODE: 1] [UPDATE_MEMORY: z]")
            .await;
        let kinds: Vec<TagKind> = result.effects.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, TagKind::PROCESSING_ORDER.to_vec());
    }

    #[test]
    fn payload_stops_at_first_closing_bracket() {
        let found = scan("[WEB_SEARCH: a [b] c]", TagKind::WebSearch);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, Tag::Search("a [b".to_string()));
        assert_eq!(found[0].0, 0..18);
    }
}
