//! LLM configuration loading and provider selection.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::ChatModel;
use crate::providers::HttpChatModel;
use crate::types::LLMProvider;
use alarmsage_core::{Error, Result};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";

/// Stored LLM configuration (`llm-config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    #[serde(default = "default_preferred")]
    pub preferred_provider: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    /// Used by the manual reranker, not for chat.
    #[serde(default)]
    pub cohere_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
}

fn default_preferred() -> String {
    "auto".into()
}
fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.into()
}
fn default_anthropic_model() -> String {
    DEFAULT_ANTHROPIC_MODEL.into()
}
fn default_groq_model() -> String {
    DEFAULT_GROQ_MODEL.into()
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            preferred_provider: "auto".into(),
            openai_api_key: None,
            anthropic_api_key: None,
            groq_api_key: None,
            cohere_api_key: None,
            openai_model: DEFAULT_OPENAI_MODEL.into(),
            anthropic_model: DEFAULT_ANTHROPIC_MODEL.into(),
            groq_model: DEFAULT_GROQ_MODEL.into(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl LLMConfig {
    /// Load config from file, falling back to env vars and defaults.
    ///
    /// A missing file means defaults; a file that exists but does not parse
    /// is a configuration error.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(config_path) {
            Ok(s) => serde_json::from_str::<LLMConfig>(&s).map_err(|e| {
                Error::Config(format!("invalid {}: {}", config_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LLMConfig::default(),
            Err(e) => return Err(e.into()),
        };
        let loaded = config.with_env_fallback(|key| std::env::var(key).ok());
        info!(
            "Loaded LLM config from {} (provider preference: {})",
            config_path.display(),
            loaded.preferred_provider
        );
        Ok(loaded)
    }

    /// Fill unset keys from `lookup` (the environment in production).
    pub fn with_env_fallback(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.openai_api_key = non_empty(self.openai_api_key).or_else(|| non_empty(lookup("OPENAI_API_KEY")));
        self.anthropic_api_key =
            non_empty(self.anthropic_api_key).or_else(|| non_empty(lookup("ANTHROPIC_API_KEY")));
        self.groq_api_key = non_empty(self.groq_api_key).or_else(|| non_empty(lookup("GROQ_API_KEY")));
        self.cohere_api_key = non_empty(self.cohere_api_key).or_else(|| non_empty(lookup("COHERE_API_KEY")));
        self
    }

    /// Resolve which provider and model to use: `(provider, model, key)`.
    pub fn resolve_provider(&self) -> Option<(LLMProvider, String, String)> {
        // Explicit preference
        if self.preferred_provider != "auto" {
            return match self.preferred_provider.as_str() {
                "openai" => self
                    .openai_api_key
                    .as_ref()
                    .map(|k| (LLMProvider::OpenAI, self.openai_model.clone(), k.clone())),
                "anthropic" => self
                    .anthropic_api_key
                    .as_ref()
                    .map(|k| (LLMProvider::Anthropic, self.anthropic_model.clone(), k.clone())),
                "groq" => self
                    .groq_api_key
                    .as_ref()
                    .map(|k| (LLMProvider::Groq, self.groq_model.clone(), k.clone())),
                _ => None,
            };
        }

        // Auto mode: OpenAI > Anthropic > Groq. The first two read page images.
        if let Some(k) = &self.openai_api_key {
            return Some((LLMProvider::OpenAI, self.openai_model.clone(), k.clone()));
        }
        if let Some(k) = &self.anthropic_api_key {
            return Some((LLMProvider::Anthropic, self.anthropic_model.clone(), k.clone()));
        }
        if let Some(k) = &self.groq_api_key {
            return Some((LLMProvider::Groq, self.groq_model.clone(), k.clone()));
        }

        None
    }
}

/// Build the chat model selected by `config`.
pub fn create_chat_model(config: &LLMConfig) -> Result<Arc<dyn ChatModel>> {
    let (provider, model, key) = config.resolve_provider().ok_or_else(|| {
        Error::Config(format!(
            "no credentials for chat provider '{}'; set OPENAI_API_KEY, ANTHROPIC_API_KEY or GROQ_API_KEY",
            config.preferred_provider
        ))
    })?;
    info!("Chat model: {} ({})", model, provider);
    Ok(Arc::new(HttpChatModel::new(provider, model, key)))
}
