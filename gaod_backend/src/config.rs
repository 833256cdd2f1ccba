use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::llm_client::{ModelDescriptor, Provider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUrls {
    #[serde(default = "default_openai_url")]
    pub openai: String,
    #[serde(default = "default_anthropic_url")]
    pub anthropic: String,
    #[serde(default = "default_google_url")]
    pub google: String,
    #[serde(default = "default_search_url")]
    pub search: String,
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_google_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_search_url() -> String {
    "https://www.googleapis.com/customsearch/v1".to_string()
}

impl Default for ProviderUrls {
    fn default() -> Self {
        Self {
            openai: default_openai_url(),
            anthropic: default_anthropic_url(),
            google: default_google_url(),
            search: default_search_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            model: default_image_model(),
            size: default_image_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaodConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_bind")]
    pub bind: String,

    // Per-user turn quota
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    // Turn pipeline
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_title_length")]
    pub title_length: usize,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_search_results")]
    pub search_results: usize,

    #[serde(default)]
    pub providers: ProviderUrls,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default = "default_model")]
    pub default_model: ModelDescriptor,

    // Seed admin, only used when the user table is empty
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    #[serde(default)]
    pub admin_password: Option<String>,
}

fn default_database_path() -> String {
    "gaod.db".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_rate_limit() -> u32 {
    10
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_history_window() -> usize {
    10
}

fn default_title_length() -> usize {
    30
}

fn default_max_message_length() -> usize {
    20_000
}

fn default_search_results() -> usize {
    3
}

fn default_model() -> ModelDescriptor {
    ModelDescriptor {
        name: "GPT-4o".to_string(),
        id: "gpt-4o".to_string(),
        provider: Provider::OpenAi,
    }
}

fn default_admin_email() -> String {
    "admin@gaod.local".to_string()
}

impl Default for GaodConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            bind: default_bind(),
            rate_limit: default_rate_limit(),
            rate_window_secs: default_rate_window_secs(),
            history_window: default_history_window(),
            title_length: default_title_length(),
            max_message_length: default_max_message_length(),
            search_results: default_search_results(),
            providers: ProviderUrls::default(),
            image: ImageConfig::default(),
            default_model: default_model(),
            admin_email: default_admin_email(),
            admin_password: None,
        }
    }
}

impl GaodConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path of `gaod_config.toml` next to the executable
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("gaod_config.toml")
    }

    /// Load config from `gaod_config.toml`, falling back to env vars + defaults
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<GaodConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("GAOD_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(bind) = env::var("GAOD_BIND") {
            config.bind = bind;
        }

        if let Ok(limit) = env::var("GAOD_RATE_LIMIT") {
            if let Ok(limit) = limit.parse() {
                config.rate_limit = limit;
            }
        }

        if let Ok(window) = env::var("GAOD_RATE_WINDOW_SECS") {
            if let Ok(seconds) = window.parse() {
                config.rate_window_secs = seconds;
            }
        }

        if let Ok(email) = env::var("GAOD_ADMIN_EMAIL") {
            config.admin_email = email;
        }

        if let Ok(password) = env::var("GAOD_ADMIN_PASSWORD") {
            if !password.is_empty() {
                config.admin_password = Some(password);
            }
        }

        if let Ok(url) = env::var("GAOD_OPENAI_URL") {
            config.providers.openai = url;
        }

        if let Ok(url) = env::var("GAOD_ANTHROPIC_URL") {
            config.providers.anthropic = url;
        }

        if let Ok(url) = env::var("GAOD_GOOGLE_URL") {
            config.providers.google = url;
        }

        if let Ok(url) = env::var("GAOD_SEARCH_URL") {
            config.providers.search = url;
        }

        // provider:model_id, e.g. "anthropic:claude-3-5-sonnet-latest"
        if let Ok(raw) = env::var("GAOD_DEFAULT_MODEL") {
            if let Some(model) = parse_model_spec(&raw) {
                config.default_model = model;
            }
        }

        config
    }
}

fn parse_model_spec(raw: &str) -> Option<ModelDescriptor> {
    let (provider, id) = raw.trim().split_once(':')?;
    let provider = Provider::parse(provider)?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    Some(ModelDescriptor {
        name: id.to_string(),
        id: id.to_string(),
        provider,
    })
}
