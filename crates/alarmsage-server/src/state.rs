//! Shared application state.

use std::sync::Arc;

use tracing::info;

use alarmsage_chat::{create_chat_model, ChatModel, LLMConfig};
use alarmsage_core::{AlarmSageConfig, ManualCatalog, Result};
use alarmsage_infer::{create_embedder, create_reranker, Embedder, Reranker};
use alarmsage_resolve::{
    AlarmSearch, FsPageImages, ManualRetriever, PageImageSource, RetrieverRegistry,
};
use alarmsage_runtime::{Agent, AgentSettings, Toolbox};
use alarmsage_store::SqliteStore;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: AlarmSageConfig,
    pub store: Arc<SqliteStore>,
    pub embedder: Arc<dyn Embedder>,
    pub alarm_search: Arc<AlarmSearch>,
    pub manuals: Arc<ManualRetriever>,
    pub agent: Arc<Agent>,
    /// Name of the chat model answering turns.
    pub chat_model: String,
}

impl AppState {
    /// Wire the engines together from already-built collaborators.
    pub fn new(
        config: AlarmSageConfig,
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        images: Arc<dyn PageImageSource>,
        catalog: &ManualCatalog,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let registry = Arc::new(RetrieverRegistry::from_catalog(catalog));
        let alarm_search = Arc::new(AlarmSearch::new(
            store.clone(),
            embedder.clone(),
            config.timeouts.clone(),
            config.retry.clone(),
        ));
        let manuals = Arc::new(ManualRetriever::new(
            store.clone(),
            embedder.clone(),
            reranker,
            registry,
            images,
            config.timeouts.clone(),
            config.retry.clone(),
        ));
        let tools = Arc::new(Toolbox::new(
            alarm_search.clone(),
            manuals.clone(),
            model.clone(),
            config.timeouts.clone(),
            config.retry.clone(),
        ));
        let chat_model = model.name().to_string();
        let agent = Arc::new(Agent::new(
            store.clone(),
            model,
            tools,
            AgentSettings::from_config(&config),
        ));

        Self {
            config,
            store,
            embedder,
            alarm_search,
            manuals,
            agent,
            chat_model,
        }
    }

    /// Build everything from configuration files and the environment.
    ///
    /// Missing chat credentials, or OpenAI embeddings without a key, fail
    /// here rather than on the first request.
    pub fn from_config(config: AlarmSageConfig) -> Result<Self> {
        let llm_config = LLMConfig::load(&config.data_paths.llm_config_file)?;
        let catalog = ManualCatalog::load(&config.data_paths.machine_models_file)?;

        let store = Arc::new(SqliteStore::open(&config.data_paths.db, config.embedding_dim)?);
        let embedder = create_embedder(
            config.embedding_provider,
            config.embedding_dim,
            llm_config.openai_api_key.as_deref(),
            None,
        )?;
        let reranker = create_reranker(llm_config.cohere_api_key.as_deref());
        let model = create_chat_model(&llm_config)?;
        let images = Arc::new(FsPageImages::new(&config.data_paths.page_images));

        info!(
            "Machine models: {}",
            catalog.model_names().collect::<Vec<_>>().join(", ")
        );
        Ok(Self::new(
            config, store, embedder, reranker, images, &catalog, model,
        ))
    }
}
