//! Configuration and data directory management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Paths to all AlarmSage data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database directory (`data/db/`).
    pub db: PathBuf,
    /// Parsed manual JSON files (`data/parsed/`).
    pub parsed_manuals: PathBuf,
    /// Rendered manual page images (`data/manuals/images/`).
    pub page_images: PathBuf,
    /// LLM configuration (`data/llm-config.json`).
    pub llm_config_file: PathBuf,
    /// Machine model → manual mapping (`data/machine-models.json`).
    pub machine_models_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            parsed_manuals: root.join("parsed"),
            page_images: root.join("manuals").join("images"),
            llm_config_file: root.join("llm-config.json"),
            machine_models_file: root.join("machine-models.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        std::fs::create_dir_all(&self.parsed_manuals)?;
        std::fs::create_dir_all(&self.page_images)?;
        Ok(())
    }
}

/// Per-suspension-point timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub embedding_ms: u64,
    pub retrieval_ms: u64,
    pub rerank_ms: u64,
    /// Time allowed until the model stream yields its first chunk.
    pub model_first_chunk_ms: u64,
    /// Maximum gap between two chunks of a model stream.
    pub model_idle_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            embedding_ms: 15_000,
            retrieval_ms: 20_000,
            rerank_ms: 20_000,
            model_first_chunk_ms: 60_000,
            model_idle_ms: 30_000,
        }
    }
}

impl Timeouts {
    pub fn embedding(&self) -> Duration {
        Duration::from_millis(self.embedding_ms)
    }
    pub fn retrieval(&self) -> Duration {
        Duration::from_millis(self.retrieval_ms)
    }
    pub fn rerank(&self) -> Duration {
        Duration::from_millis(self.rerank_ms)
    }
    pub fn model_first_chunk(&self) -> Duration {
        Duration::from_millis(self.model_first_chunk_ms)
    }
    pub fn model_idle(&self) -> Duration {
        Duration::from_millis(self.model_idle_ms)
    }
}

/// Which embedding backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
    /// Deterministic local feature hashing (offline / development).
    Hashing,
}

/// Static mapping from machine model to the manuals that document it.
///
/// Collections are named after the manual file without its extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualCatalog {
    pub models: BTreeMap<String, Vec<String>>,
}

impl Default for ManualCatalog {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "Model A".to_string(),
            [
                "63942EN.pdf",
                "63944ENV1.pdf",
                "63944ENV2.pdf",
                "64044EN.pdf",
                "64164EN.pdf",
                "B-63943EN-03-110525.pdf",
                "B-63945EN_02_V2004-07-26.pdf",
                "B-63950EN_02.pdf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        );
        models.insert(
            "Model B".to_string(),
            vec![
                "FANUC31iB5-B64484EN203OperManual.pdf".to_string(),
                "B-64483EN-2_01.pdf".to_string(),
            ],
        );
        Self { models }
    }
}

impl ManualCatalog {
    /// Load from a JSON object `{ "<model>": ["<manual file>", ...] }`,
    /// falling back to the built-in catalog when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let models: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                info!("Loaded {} machine models from {}", models.len(), path.display());
                Ok(Self { models })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "{} not found, using built-in machine model catalog",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Ordered collection names for a model, or `None` if unconfigured.
    pub fn collections_for(&self, model: &str) -> Option<Vec<String>> {
        self.models
            .get(model)
            .map(|manuals| manuals.iter().map(|m| collection_name(m)).collect())
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(|s| s.as_str())
    }
}

/// Manual file name without its extension (`63942EN.pdf` → `63942EN`).
pub fn collection_name(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => file_name[..idx].to_string(),
        _ => file_name.to_string(),
    }
}

/// Top-level AlarmSage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSageConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// Embedding dimension shared by alarms and manual chunks.
    pub embedding_dim: usize,
    pub embedding_provider: EmbeddingProviderKind,
    /// Machine model used when a request does not name one.
    pub default_machine_model: String,
    /// Upper bound on AGENT steps within one turn.
    pub max_agent_iterations: usize,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

impl AlarmSageConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let port = env_parse("PORT").unwrap_or(3004);
        let data_paths = DataPaths::new(data_dir)?;

        let embedding_provider = match std::env::var("EMBEDDING_PROVIDER").as_deref() {
            Ok("hashing") => EmbeddingProviderKind::Hashing,
            _ => EmbeddingProviderKind::OpenAi,
        };

        let mut timeouts = Timeouts::default();
        if let Some(ms) = env_parse("EMBEDDING_TIMEOUT_MS") {
            timeouts.embedding_ms = ms;
        }
        if let Some(ms) = env_parse("RETRIEVAL_TIMEOUT_MS") {
            timeouts.retrieval_ms = ms;
        }
        if let Some(ms) = env_parse("RERANK_TIMEOUT_MS") {
            timeouts.rerank_ms = ms;
        }
        if let Some(ms) = env_parse("MODEL_TIMEOUT_MS") {
            timeouts.model_first_chunk_ms = ms;
        }

        let mut retry = RetryPolicy::default();
        if let Some(n) = env_parse("RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = n;
        }

        Ok(Self {
            port,
            data_paths,
            embedding_dim: 384,
            embedding_provider,
            default_machine_model: std::env::var("DEFAULT_MACHINE_MODEL")
                .unwrap_or_else(|_| "Model A".into()),
            max_agent_iterations: env_parse("MAX_AGENT_ITERATIONS").unwrap_or(10),
            timeouts,
            retry,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_strips_extension() {
        assert_eq!(collection_name("63942EN.pdf"), "63942EN");
        assert_eq!(
            collection_name("B-63945EN_02_V2004-07-26.pdf"),
            "B-63945EN_02_V2004-07-26"
        );
        assert_eq!(collection_name("no_extension"), "no_extension");
    }

    #[test]
    fn test_default_catalog_models() {
        let catalog = ManualCatalog::default();
        let a = catalog.collections_for("Model A").unwrap();
        assert_eq!(a.len(), 8);
        assert_eq!(a[0], "63942EN");
        assert!(catalog.collections_for("Model Z").is_none());
    }

    #[test]
    fn test_catalog_load_from_file_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(ManualCatalog::load(&missing).unwrap(), ManualCatalog::default());

        let path = dir.path().join("machine-models.json");
        std::fs::write(&path, r#"{"Lathe X": ["lathe-ops.pdf", "lathe-alarms.pdf"]}"#).unwrap();
        let catalog = ManualCatalog::load(&path).unwrap();
        assert_eq!(
            catalog.collections_for("Lathe X").unwrap(),
            vec!["lathe-ops".to_string(), "lathe-alarms".to_string()]
        );

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(ManualCatalog::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_data_paths_created() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        assert!(paths.db.is_dir());
        assert!(paths.page_images.is_dir());
    }
}
