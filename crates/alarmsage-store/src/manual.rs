//! Manual chunk collections: one named partition per indexed manual.

use ndarray::Array1;
use rusqlite::params;
use tracing::{debug, info};

use crate::embedding::QuantizedVector;
use crate::sqlite::{db_err, now_millis, read_quantized_row, SqliteStore};
use crate::types::{ManualChunk, MediaType, NewManualChunk, ScoredChunk};
use crate::vector::VectorIndex;
use alarmsage_core::{Error, Result};

impl SqliteStore {
    /// Clear a collection and repopulate it in one transaction.
    ///
    /// Readers see either the old collection or the new one, never a mix.
    pub fn replace_collection(&self, collection: &str, chunks: &[NewManualChunk]) -> Result<usize> {
        if collection.trim().is_empty() {
            return Err(Error::Validation("collection name is required".into()));
        }
        for chunk in chunks {
            self.check_embedding(&chunk.embedding)?;
        }

        let now = now_millis();
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "DELETE FROM manual_chunks WHERE collection = ?1",
                params![collection],
            )
            .map_err(db_err)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO manual_chunks \
                         (collection, chunk_index, text, page, media_type, file_name, \
                          embedding, scale, offset_val, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )
                    .map_err(db_err)?;
                for (i, chunk) in chunks.iter().enumerate() {
                    let q = QuantizedVector::quantize(&chunk.embedding);
                    stmt.execute(params![
                        collection,
                        i as i64,
                        chunk.text,
                        chunk.page,
                        chunk.media_type.as_str(),
                        chunk.file_name,
                        q.bytes,
                        q.scale as f64,
                        q.offset as f64,
                        now
                    ])
                    .map_err(db_err)?;
                }
            }
            tx.commit().map_err(db_err)?;
        }

        self.manual_indexes.lock().remove(collection);
        info!("Indexed collection '{}' with {} chunks", collection, chunks.len());
        Ok(chunks.len())
    }

    /// Names of all non-empty collections.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT collection FROM manual_chunks ORDER BY collection")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn count_collection_chunks(&self, collection: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM manual_chunks WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Chunks of a collection in indexing order.
    pub fn collection_chunks(&self, collection: &str) -> Result<Vec<ManualChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, collection, chunk_index, text, page, media_type, file_name \
                 FROM manual_chunks WHERE collection = ?1 ORDER BY chunk_index",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![collection], row_to_chunk)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn load_collection_index(&self, collection: &str) -> Result<VectorIndex> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, embedding, scale, offset_val FROM manual_chunks \
                     WHERE collection = ?1 ORDER BY chunk_index",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![collection], read_quantized_row)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let entries = rows
            .into_iter()
            .map(|(id, q)| (id, q.dequantize()))
            .collect::<Vec<_>>();
        let index = VectorIndex::from_rows(self.embedding_dim, entries)
            .map_err(|e| Error::Consistency(format!("collection '{}': {}", collection, e)))?;
        debug!("Loaded {} chunks for collection '{}'", index.len(), collection);
        Ok(index)
    }

    /// Top-`k` chunks of one collection by cosine similarity, best first.
    ///
    /// An unknown or empty collection yields no matches.
    pub fn search_collection(
        &self,
        collection: &str,
        query_embedding: &Array1<f32>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let hits = {
            let mut indexes = self.manual_indexes.lock();
            if !indexes.contains_key(collection) {
                let index = self.load_collection_index(collection)?;
                indexes.insert(collection.to_string(), index);
            }
            match indexes.get(collection) {
                Some(index) => index.search(query_embedding, top_k)?,
                None => Vec::new(),
            }
        };

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, collection, chunk_index, text, page, media_type, file_name \
                 FROM manual_chunks WHERE id = ?1",
            )
            .map_err(db_err)?;
        let mut results = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            let chunk = stmt.query_row(params![id], row_to_chunk).map_err(db_err)?;
            results.push(ScoredChunk {
                chunk,
                score: score as f64,
            });
        }
        Ok(results)
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualChunk> {
    let media: String = row.get(5)?;
    let media_type = MediaType::parse(&media).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown media type '{}'", media).into(),
        )
    })?;
    Ok(ManualChunk {
        id: row.get(0)?,
        collection: row.get(1)?,
        chunk_index: row.get(2)?,
        text: row.get(3)?,
        page: row.get(4)?,
        media_type,
        file_name: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::sqlite::tests::{test_store, unit, DIM};
    use crate::types::{MediaType, NewManualChunk};
    use alarmsage_core::Error;
    use ndarray::Array1;

    fn chunk(text: &str, page: i32, media_type: MediaType, axis: usize) -> NewManualChunk {
        NewManualChunk {
            text: text.into(),
            page,
            media_type,
            file_name: "manual-a.pdf".into(),
            embedding: unit(axis),
        }
    }

    #[test]
    fn test_search_within_collection_only() {
        let (store, _dir) = test_store();
        store
            .replace_collection(
                "manual-a",
                &[
                    chunk("spindle overheating", 1, MediaType::Text, 0),
                    chunk("coolant pump", 2, MediaType::Table, 1),
                ],
            )
            .unwrap();
        store
            .replace_collection("manual-b", &[chunk("other manual", 1, MediaType::Text, 0)])
            .unwrap();

        let hits = store
            .search_collection("manual-a", &Array1::from_vec(unit(1)), 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.text, "coolant pump");
        assert_eq!(hits[0].chunk.media_type, MediaType::Table);
        assert!(hits.iter().all(|h| h.chunk.collection == "manual-a"));
    }

    #[test]
    fn test_replace_collection_discards_old_chunks() {
        let (store, _dir) = test_store();
        store
            .replace_collection("manual-a", &[chunk("old", 1, MediaType::Text, 0)])
            .unwrap();
        // Populate the cached index before replacing.
        store
            .search_collection("manual-a", &Array1::from_vec(unit(0)), 5)
            .unwrap();

        store
            .replace_collection(
                "manual-a",
                &[
                    chunk("new one", 3, MediaType::Markdown, 0),
                    chunk("new two", 4, MediaType::Image, 2),
                ],
            )
            .unwrap();

        assert_eq!(store.count_collection_chunks("manual-a").unwrap(), 2);
        let hits = store
            .search_collection("manual-a", &Array1::from_vec(unit(0)), 5)
            .unwrap();
        assert_eq!(hits[0].chunk.text, "new one");
        assert!(hits.iter().all(|h| h.chunk.text != "old"));

        let texts: Vec<_> = store
            .collection_chunks("manual-a")
            .unwrap()
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(texts, vec!["new one", "new two"]);
    }

    #[test]
    fn test_unknown_collection_is_empty() {
        let (store, _dir) = test_store();
        let hits = store
            .search_collection("missing", &Array1::from_vec(unit(0)), 5)
            .unwrap();
        assert!(hits.is_empty());
        assert!(store.list_collections().unwrap().is_empty());
    }

    #[test]
    fn test_bad_embedding_leaves_collection_untouched() {
        let (store, _dir) = test_store();
        store
            .replace_collection("manual-a", &[chunk("keep", 1, MediaType::Text, 0)])
            .unwrap();

        let mut bad = chunk("bad", 1, MediaType::Text, 0);
        bad.embedding = vec![0.0; DIM + 1];
        let err = store.replace_collection("manual-a", &[bad]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.count_collection_chunks("manual-a").unwrap(), 1);
        assert_eq!(store.list_collections().unwrap(), vec!["manual-a".to_string()]);
    }
}
