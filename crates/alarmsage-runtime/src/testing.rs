//! Test harness: a temp store, offline embeddings and a scripted model.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::orchestrator::Agent;
use crate::tools::Toolbox;
use crate::types::{AgentSettings, TurnEvent, TurnRequest};
use alarmsage_chat::{Script, ScriptedModel};
use alarmsage_core::{ManualCatalog, RetryPolicy, Timeouts};
use alarmsage_infer::{Embedder, HashingEmbedder, PassthroughReranker};
use alarmsage_resolve::{AlarmSearch, FsPageImages, ManualRetriever, RetrieverRegistry};
use alarmsage_store::{MediaType, NewAlarm, NewManualChunk, SqliteStore};

pub const TEST_DIM: usize = 32;
pub const TEST_COLLECTION: &str = "manual-a";

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub model: Arc<ScriptedModel>,
    pub tools: Arc<Toolbox>,
    pub agent: Arc<Agent>,
    settings: AgentSettings,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// A sender whose events are read and discarded.
    pub fn sink(&self) -> mpsc::Sender<TurnEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tx
    }

    pub fn set_max_iterations(&mut self, max: usize) {
        self.settings.max_iterations = max;
        self.agent = Arc::new(Agent::new(
            self.store.clone(),
            self.model.clone(),
            self.tools.clone(),
            self.settings.clone(),
        ));
    }
}

pub fn settings() -> AgentSettings {
    AgentSettings {
        max_iterations: 10,
        default_machine_model: "Model A".into(),
        timeouts: Timeouts {
            model_first_chunk_ms: 2_000,
            model_idle_ms: 2_000,
            ..Timeouts::default()
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
    }
}

pub fn harness(scripts: Vec<Script>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path(), TEST_DIM).unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(TEST_DIM));
    let model = Arc::new(ScriptedModel::new(scripts));
    let settings = settings();

    let mut models = BTreeMap::new();
    models.insert("Model A".to_string(), vec![format!("{}.pdf", TEST_COLLECTION)]);
    let registry = Arc::new(RetrieverRegistry::from_catalog(&ManualCatalog { models }));

    let alarms = Arc::new(AlarmSearch::new(
        store.clone(),
        embedder.clone(),
        settings.timeouts.clone(),
        settings.retry.clone(),
    ));
    let manuals = Arc::new(ManualRetriever::new(
        store.clone(),
        embedder,
        Arc::new(PassthroughReranker),
        registry,
        Arc::new(FsPageImages::new(dir.path().join("images"))),
        settings.timeouts.clone(),
        settings.retry.clone(),
    ));
    let tools = Arc::new(Toolbox::new(
        alarms,
        manuals,
        model.clone(),
        settings.timeouts.clone(),
        settings.retry.clone(),
    ));
    let agent = Arc::new(Agent::new(
        store.clone(),
        model.clone(),
        tools.clone(),
        settings.clone(),
    ));

    Harness {
        store,
        model,
        tools,
        agent,
        settings,
        _dir: dir,
    }
}

pub fn seed_alarm(h: &Harness, code: &str, message: &str, desc: &str) -> i64 {
    let alarm = NewAlarm {
        code: code.into(),
        message: message.into(),
        desc: desc.into(),
        solution: None,
        machine_type: "Model A".into(),
    };
    let embedding = HashingEmbedder::new(TEST_DIM).embed_sync(&alarm.embedding_text());
    h.store
        .create_alarm(&alarm, embedding.as_slice().unwrap())
        .unwrap()
        .id
}

pub fn seed_manual(h: &Harness, text: &str) {
    let chunk = NewManualChunk {
        text: text.into(),
        page: 1,
        media_type: MediaType::Text,
        file_name: format!("{}.pdf", TEST_COLLECTION),
        embedding: HashingEmbedder::new(TEST_DIM).embed_sync(text).to_vec(),
    };
    h.store.replace_collection(TEST_COLLECTION, &[chunk]).unwrap();
}

pub fn turn(thread_id: &str, question: &str) -> TurnRequest {
    TurnRequest {
        thread_id: thread_id.into(),
        question: question.into(),
        machine_model: "Model A".into(),
    }
}
