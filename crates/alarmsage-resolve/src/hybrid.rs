//! Alarm hybrid search: FTS5 keyword lookups on code and message, vector
//! search on description and on the combined query, merged keyword-first.

use std::collections::HashSet;
use std::sync::Arc;

use ndarray::Array1;
use serde::Deserialize;
use tracing::debug;

use alarmsage_core::retry::{with_backoff, with_timeout};
use alarmsage_core::{Error, Result, RetryPolicy, Timeouts};
use alarmsage_infer::Embedder;
use alarmsage_store::{AlarmField, AlarmRecord, SqliteStore};

/// Keyword hits taken from the code column.
pub const CODE_MATCH_CAP: i64 = 4;
/// Keyword hits taken from the message column.
pub const MESSAGE_MATCH_CAP: i64 = 8;
/// Vector hits taken for the description alone.
pub const DESCRIPTION_MATCH_CAP: usize = 8;
/// Vector hits for the combined query when the caller sets no limit.
pub const DEFAULT_COMBINED_CAP: usize = 10;

/// Query-string form of a hybrid search request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlarmQuery {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub description: String,
    /// `<= 0` means "no limit".
    #[serde(default)]
    pub limit: i64,
}

pub struct AlarmSearch {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl AlarmSearch {
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        timeouts: Timeouts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            timeouts,
            retry,
        }
    }

    pub async fn search(&self, query: &AlarmQuery) -> Result<Vec<AlarmRecord>> {
        self.hybrid_search(&query.code, &query.message, &query.description, query.limit)
            .await
    }

    /// Candidates from every signal, deduplicated by id (first occurrence
    /// wins), keyword and description matches ahead of the combined-vector
    /// matches. `limit > 0` truncates the merged list.
    pub async fn hybrid_search(
        &self,
        code: &str,
        message: &str,
        description: &str,
        limit: i64,
    ) -> Result<Vec<AlarmRecord>> {
        let code = code.trim();
        let message = message.trim();
        let description = description.trim();

        let combined = format!("{} {} {}", code, message, description);
        let combined = combined.trim();
        if combined.is_empty() {
            return Ok(Vec::new());
        }

        let mut primary: Vec<AlarmRecord> = Vec::new();

        if !code.is_empty() {
            let code = code.to_string();
            primary.extend(
                self.on_store(move |store| {
                    store.fts_search_alarms(Some(AlarmField::Code), &code, CODE_MATCH_CAP)
                })
                .await?,
            );
        }
        if !message.is_empty() {
            let message = message.to_string();
            primary.extend(
                self.on_store(move |store| {
                    store.fts_search_alarms(Some(AlarmField::Message), &message, MESSAGE_MATCH_CAP)
                })
                .await?,
            );
        }
        if !description.is_empty() {
            let embedding = self.embed(description).await?;
            primary.extend(
                self.on_store(move |store| {
                    store.vector_search_alarms(&embedding, DESCRIPTION_MATCH_CAP)
                })
                .await?,
            );
        }

        let combined_cap = if limit > 0 {
            limit as usize
        } else {
            DEFAULT_COMBINED_CAP
        };
        let embedding = self.embed(combined).await?;
        let secondary = self
            .on_store(move |store| store.vector_search_alarms(&embedding, combined_cap))
            .await?;

        let mut seen = HashSet::new();
        let mut merged: Vec<AlarmRecord> = primary
            .into_iter()
            .chain(secondary)
            .filter(|a| seen.insert(a.id))
            .collect();

        if limit > 0 {
            merged.truncate(limit as usize);
        }
        debug!(
            "hybrid search code={:?} message={:?} → {} alarms",
            code,
            message,
            merged.len()
        );
        Ok(merged)
    }

    /// Run a blocking store query off the async executor.
    async fn on_store<T, F>(&self, query: F) -> Result<T>
    where
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || query(&store))
            .await
            .map_err(|e| Error::Internal(format!("search task failed: {}", e)))?
    }

    async fn embed(&self, text: &str) -> Result<Array1<f32>> {
        let limit = self.timeouts.embedding();
        with_backoff(&self.retry, "alarm query embedding", || {
            with_timeout("alarm query embedding", limit, self.embedder.embed(text))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        alarm, raw_sql, test_store, CountingEmbedder, FailingEmbedder, TEST_DIM,
    };
    use alarmsage_infer::HashingEmbedder;

    fn search_with(store: Arc<SqliteStore>, embedder: Arc<dyn Embedder>) -> AlarmSearch {
        AlarmSearch::new(store, embedder, Timeouts::default(), RetryPolicy::none())
    }

    fn seed(store: &SqliteStore) -> Vec<AlarmRecord> {
        let e = HashingEmbedder::new(TEST_DIM);
        [
            ("SW0100", "PARAMETER ENABLE SWITCH ON", "The parameter write switch is enabled"),
            ("PS0002", "ILLEGAL USE OF G41.2/G42.2", "Cutter compensation command misuse"),
            ("SV0401", "SERVO V READY OFF", "Servo amplifier ready signal dropped"),
            ("OH0700", "SPINDLE OVERHEAT", "Spindle motor temperature too high"),
        ]
        .iter()
        .map(|(c, m, d)| {
            let a = alarm(c, m, d);
            store
                .create_alarm(&a, e.embed_sync(&a.embedding_text()).as_slice().unwrap())
                .unwrap()
        })
        .collect()
    }

    #[tokio::test]
    async fn test_all_empty_makes_no_embedding_call() {
        let (store, _dir) = test_store();
        let embedder = Arc::new(CountingEmbedder::new());
        let search = search_with(store, embedder.clone());

        let hits = search.hybrid_search("  ", "", "\t", 10).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_code_match_ranks_first() {
        let (store, _dir) = test_store();
        let alarms = seed(&store);
        let search = search_with(store, Arc::new(HashingEmbedder::new(TEST_DIM)));

        let hits = search.hybrid_search("0401", "", "", 10).await.unwrap();
        assert_eq!(hits[0].id, alarms[2].id);
    }

    #[tokio::test]
    async fn test_keyword_and_vector_hit_listed_once_at_keyword_position() {
        let (store, _dir) = test_store();
        let alarms = seed(&store);
        let search = search_with(store, Arc::new(HashingEmbedder::new(TEST_DIM)));

        // OH0700 matches on message and on the description vector.
        let hits = search
            .hybrid_search("", "SPINDLE OVERHEAT", "Spindle motor temperature too high", 0)
            .await
            .unwrap();
        let positions: Vec<usize> = hits
            .iter()
            .enumerate()
            .filter(|(_, a)| a.id == alarms[3].id)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(positions, vec![0]);
    }

    #[tokio::test]
    async fn test_single_record_code_lookup() {
        let (store, _dir) = test_store();
        let e = HashingEmbedder::new(TEST_DIM);
        let a = alarm("SW0100", "PARAMETER ENABLE SWITCH ON", "Parameter writing is enabled");
        let created = store
            .create_alarm(&a, e.embed_sync(&a.embedding_text()).as_slice().unwrap())
            .unwrap();
        let search = search_with(store, Arc::new(e));

        let hits = search.hybrid_search("SW0100", "", "", 5).await.unwrap();
        assert_eq!(hits, vec![created]);
    }

    #[tokio::test]
    async fn test_results_unique_and_limited() {
        let (store, _dir) = test_store();
        seed(&store);
        let search = search_with(store, Arc::new(HashingEmbedder::new(TEST_DIM)));

        let hits = search
            .hybrid_search("SW0100", "SWITCH ON", "parameter switch", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_ne!(hits[0].id, hits[1].id);
        assert_eq!(hits[0].code, "SW0100");
    }

    #[tokio::test]
    async fn test_no_limit_returns_merged_set() {
        let (store, _dir) = test_store();
        seed(&store);
        let search = search_with(store, Arc::new(HashingEmbedder::new(TEST_DIM)));

        let hits = search.hybrid_search("", "SPINDLE", "", 0).await.unwrap();
        let ids: HashSet<i64> = hits.iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), hits.len());
        // Every alarm is within the default combined cap.
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].code, "OH0700");

        let negative = search.hybrid_search("", "SPINDLE", "", -1).await.unwrap();
        assert_eq!(negative, hits);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_search() {
        let (store, _dir) = test_store();
        seed(&store);
        let search = search_with(store, Arc::new(FailingEmbedder));

        let err = search.hybrid_search("SW0100", "", "", 5).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_description_only_embeds_twice() {
        let (store, _dir) = test_store();
        let embedder = Arc::new(CountingEmbedder::new());
        let search = search_with(store, embedder.clone());

        search.hybrid_search("", "", "motor hot", 5).await.unwrap();
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_slow_embedding_times_out() {
        let (store, _dir) = test_store();
        let mut timeouts = Timeouts::default();
        timeouts.embedding_ms = 10;
        let search = AlarmSearch::new(
            store,
            Arc::new(crate::testing::SlowEmbedder),
            timeouts,
            RetryPolicy::none(),
        );
        let err = search.hybrid_search("SW0100", "", "", 5).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_index_entries_without_rows_are_skipped() {
        let (store, dir) = test_store();
        let alarms = seed(&store);
        let gone = alarms[0].id;
        raw_sql(dir.path(), &format!("DELETE FROM alarm WHERE id = {}", gone));
        let search = search_with(store, Arc::new(HashingEmbedder::new(TEST_DIM)));

        let hits = search.hybrid_search("SV0401", "", "", 5).await.unwrap();
        assert_eq!(hits[0].id, alarms[2].id);
        assert!(hits.iter().all(|a| a.id != gone));
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_searches_on_worker_pool() {
        let (store, _dir) = test_store();
        seed(&store);
        let search = Arc::new(search_with(store, Arc::new(HashingEmbedder::new(TEST_DIM))));

        let tasks: Vec<_> = ["SW0100", "PS0002", "SV0401", "OH0700"]
            .into_iter()
            .map(|code| {
                let search = search.clone();
                tokio::spawn(async move { search.hybrid_search(code, "", "", 1).await })
            })
            .collect();
        for (task, code) in tasks.into_iter().zip(["SW0100", "PS0002", "SV0401", "OH0700"]) {
            let hits = task.await.unwrap().unwrap();
            assert_eq!(hits[0].code, code);
        }
    }
}
