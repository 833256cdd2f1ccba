use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::auth::AuthService;
use crate::chat::{ChatEvent, ChatService};
use crate::config::GaodConfig;
use crate::database::GaodDatabase;
use crate::http_client::build_http_client;
use crate::llm_client::LlmClient;
use crate::store::{ConversationStore, InMemoryStore, SettingsStore, UserStore};
use crate::tools::image::OpenAiImageClient;
use crate::tools::search::GoogleSearchClient;

/// Database path that selects the process-local store instead of SQLite.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

pub struct GaodRuntime {
    pub config: GaodConfig,
    pub chat: Arc<ChatService>,
    pub auth: AuthService,
    pub settings: Arc<dyn SettingsStore>,
}

struct Stores {
    settings: Arc<dyn SettingsStore>,
    conversations: Arc<dyn ConversationStore>,
    users: Arc<dyn UserStore>,
}

fn open_stores(database_path: &str) -> Result<Stores> {
    if database_path == IN_MEMORY_DATABASE {
        tracing::warn!("Using in-memory store; conversations are lost on restart");
        let store = Arc::new(InMemoryStore::new());
        return Ok(Stores {
            settings: store.clone(),
            conversations: store.clone(),
            users: store,
        });
    }

    let db = Arc::new(
        GaodDatabase::new(database_path)
            .with_context(|| format!("Failed to open database at {}", database_path))?,
    );
    Ok(Stores {
        settings: db.clone(),
        conversations: db.clone(),
        users: db,
    })
}

impl GaodRuntime {
    pub async fn bootstrap(config: GaodConfig, event_tx: Sender<ChatEvent>) -> Result<Self> {
        let stores = open_stores(&config.database_path)?;
        let http = build_http_client()?;

        let generator = Arc::new(LlmClient::new(
            config.providers.clone(),
            stores.settings.clone(),
            http.clone(),
        ));
        let search = Arc::new(GoogleSearchClient::new(
            config.providers.search.clone(),
            stores.settings.clone(),
            http.clone(),
        ));
        let image = Arc::new(OpenAiImageClient::new(
            config.providers.openai.clone(),
            config.image.clone(),
            stores.settings.clone(),
            http,
        ));

        let chat = Arc::new(ChatService::new(
            &config,
            stores.conversations,
            stores.settings.clone(),
            generator,
            search,
            image,
            event_tx,
        ));

        let auth = AuthService::new(stores.users);
        auth.ensure_seed_admin(&config.admin_email, config.admin_password.as_deref())
            .await
            .context("Failed to create seed admin")?;

        tracing::info!(
            "Gaod runtime ready (store: {}, default model: {} via {})",
            config.database_path,
            config.default_model.id,
            config.default_model.provider
        );

        Ok(Self {
            config,
            chat,
            auth,
            settings: stores.settings,
        })
    }
}
