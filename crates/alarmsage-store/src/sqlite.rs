//! SQLite alarm store with FTS5 trigram search and uint8 vector search.
//!
//! Manual collections live in `manual.rs`, conversation state in
//! `checkpoint.rs`; both share the connection held here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::Array1;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use crate::embedding::QuantizedVector;
use crate::schema::{FTS_SCHEMA_SQL, FTS_TRIGGERS_SQL, SCHEMA_SQL};
use crate::types::*;
use crate::vector::VectorIndex;
use alarmsage_core::{Error, Result};

const PINNED_ALARMS_KEY: &str = "pinnedAlarms";

/// Alarm fields covered by the full-text index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmField {
    Code,
    Message,
    Desc,
}

impl AlarmField {
    fn column(&self) -> &'static str {
        match self {
            AlarmField::Code => "code",
            AlarmField::Message => "message",
            AlarmField::Desc => "desc",
        }
    }
}

/// SQLite store for alarms, manual collections and conversation checkpoints.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
    db_path: PathBuf,
    pub(crate) embedding_dim: usize,
    alarm_index: Mutex<VectorIndex>,
    /// Lazily loaded per-collection indexes; absent means "load on next search".
    pub(crate) manual_indexes: Mutex<HashMap<String, VectorIndex>>,
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteStore {
    /// Open or create the store. The file will be `db_dir/alarmsage.db`.
    pub fn open(db_dir: impl AsRef<Path>, embedding_dim: usize) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("alarmsage.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
            embedding_dim,
            alarm_index: Mutex::new(VectorIndex::new(embedding_dim)),
            manual_indexes: Mutex::new(HashMap::new()),
        };

        store.load_alarm_index()?;

        info!(
            "SqliteStore initialized: {} alarms, {} embedded, dim={}, path={}",
            store.count_alarms()?,
            store.alarm_index.lock().len(),
            embedding_dim,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -65536;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}\n{}", SCHEMA_SQL, FTS_SCHEMA_SQL, FTS_TRIGGERS_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub(crate) fn check_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedding_dim {
            return Err(Error::Validation(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.embedding_dim,
                embedding.len()
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Alarm CRUD
    // ---------------------------------------------------------------

    /// Insert an alarm together with its precomputed embedding.
    ///
    /// Row, FTS entry and embedding are written in one transaction.
    pub fn create_alarm(&self, alarm: &NewAlarm, embedding: &[f32]) -> Result<AlarmRecord> {
        validate_alarm(alarm)?;
        self.check_embedding(embedding)?;
        let now = now_millis();

        let id = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db_err)?;
            let id = tx
                .prepare_cached(
                    "INSERT INTO alarm (code, message, desc, solution, machine_type, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(db_err)?
                .insert(params![
                    alarm.code,
                    alarm.message,
                    alarm.desc,
                    alarm.solution,
                    alarm.machine_type,
                    now
                ])
                .map_err(db_err)?;
            write_alarm_embedding(&tx, id, embedding)?;
            tx.commit().map_err(db_err)?;
            id
        };

        self.alarm_index
            .lock()
            .upsert(id, &Array1::from_vec(embedding.to_vec()))?;
        debug!("Created alarm {} ({})", id, alarm.code);

        Ok(AlarmRecord {
            id,
            code: alarm.code.clone(),
            message: alarm.message.clone(),
            desc: alarm.desc.clone(),
            solution: alarm.solution.clone(),
            machine_type: alarm.machine_type.clone(),
            updated_at: now,
        })
    }

    /// Replace an alarm's fields and embedding in one transaction.
    pub fn update_alarm(&self, id: i64, alarm: &NewAlarm, embedding: &[f32]) -> Result<AlarmRecord> {
        validate_alarm(alarm)?;
        self.check_embedding(embedding)?;
        let now = now_millis();

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db_err)?;
            let changed = tx
                .execute(
                    "UPDATE alarm SET code = ?1, message = ?2, desc = ?3, solution = ?4, \
                     machine_type = ?5, updated_at = ?6 WHERE id = ?7",
                    params![
                        alarm.code,
                        alarm.message,
                        alarm.desc,
                        alarm.solution,
                        alarm.machine_type,
                        now,
                        id
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("alarm {}", id)));
            }
            write_alarm_embedding(&tx, id, embedding)?;
            tx.commit().map_err(db_err)?;
        }

        self.alarm_index
            .lock()
            .upsert(id, &Array1::from_vec(embedding.to_vec()))?;

        Ok(AlarmRecord {
            id,
            code: alarm.code.clone(),
            message: alarm.message.clone(),
            desc: alarm.desc.clone(),
            solution: alarm.solution.clone(),
            machine_type: alarm.machine_type.clone(),
            updated_at: now,
        })
    }

    /// Delete an alarm. The embedding row goes with it (FK cascade), the FTS
    /// entry via trigger, and the id is dropped from the pinned set.
    pub fn delete_alarm(&self, id: i64) -> Result<bool> {
        let deleted = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db_err)?;
            let deleted = tx
                .execute("DELETE FROM alarm WHERE id = ?1", params![id])
                .map_err(db_err)?
                > 0;
            if deleted {
                let mut pinned = read_pinned(&tx)?;
                if let Some(pos) = pinned.iter().position(|&p| p == id) {
                    pinned.remove(pos);
                    write_pinned(&tx, &pinned)?;
                }
            }
            tx.commit().map_err(db_err)?;
            deleted
        };

        if deleted {
            self.alarm_index.lock().remove(id);
        }
        Ok(deleted)
    }

    pub fn get_alarm(&self, id: i64) -> Result<Option<AlarmRecord>> {
        let conn = self.conn.lock();
        let alarm = conn
            .prepare_cached("SELECT * FROM alarm WHERE id = ?1")
            .map_err(db_err)?
            .query_row(params![id], Self::row_to_alarm)
            .optional()
            .map_err(db_err)?;
        Ok(alarm)
    }

    /// Fetch alarms by id, preserving the order of `ids` and skipping missing ones.
    pub fn get_alarms(&self, ids: &[i64]) -> Result<Vec<AlarmRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM alarm WHERE id = ?1")
            .map_err(db_err)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(alarm) = stmt
                .query_row(params![id], Self::row_to_alarm)
                .optional()
                .map_err(db_err)?
            {
                out.push(alarm);
            }
        }
        Ok(out)
    }

    pub fn count_alarms(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM alarm", [], |row| row.get(0))
            .map_err(db_err)
    }

    /// List alarms, newest first. With `search`, rows come from the full-text
    /// index in rank order instead. `limit < 0` means no limit.
    pub fn list_alarms(
        &self,
        search: Option<&str>,
        machine_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AlarmRecord>> {
        if let Some(search) = search.filter(|s| !s.trim().is_empty()) {
            return self.fts_query(&fts_phrase(search), machine_type, limit);
        }

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM alarm WHERE (?1 IS NULL OR machine_type = ?1) \
                 ORDER BY updated_at DESC, id DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![machine_type, limit], Self::row_to_alarm)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Codes that appear on more than one alarm, with their counts.
    pub fn duplicate_codes(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT code, COUNT(*) AS n FROM alarm GROUP BY code HAVING n > 1 ORDER BY code",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Full-text Search (FTS5 trigram)
    // ---------------------------------------------------------------

    /// Phrase search over the indexed alarm fields, ranked by FTS rank.
    ///
    /// `field` restricts the match to one column. Trigram matching needs at
    /// least three characters; shorter input matches nothing.
    pub fn fts_search_alarms(
        &self,
        field: Option<AlarmField>,
        text: &str,
        limit: i64,
    ) -> Result<Vec<AlarmRecord>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let phrase = fts_phrase(text);
        let query = match field {
            Some(f) => format!("{} : {}", f.column(), phrase),
            None => phrase,
        };
        self.fts_query(&query, None, limit)
    }

    fn fts_query(
        &self,
        query: &str,
        machine_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AlarmRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT a.* FROM alarm_fts \
                 JOIN alarm a ON a.id = alarm_fts.rowid \
                 WHERE alarm_fts MATCH ?1 \
                   AND (?2 IS NULL OR a.machine_type = ?2) \
                 ORDER BY alarm_fts.rank \
                 LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![query, machine_type, limit], Self::row_to_alarm)
            .map_err(|e| Error::Search(format!("full-text query failed: {}", e)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Search(format!("full-text query failed: {}", e)))
    }

    // ---------------------------------------------------------------
    // Alarm Vector Search
    // ---------------------------------------------------------------

    fn load_alarm_index(&self) -> Result<()> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT alarm_id, embedding, scale, offset_val FROM alarm_embeddings")
                .map_err(db_err)?;
            let rows = stmt.query_map([], read_quantized_row).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (id, q) in rows {
            if q.dim() != self.embedding_dim {
                return Err(Error::Consistency(format!(
                    "alarm {} embedding has dimension {}, store expects {}",
                    id,
                    q.dim(),
                    self.embedding_dim
                )));
            }
            entries.push((id, q.dequantize()));
        }

        let index = VectorIndex::from_rows(self.embedding_dim, entries)?;
        debug!("Loaded {} alarm embeddings into matrix", index.len());
        *self.alarm_index.lock() = index;
        Ok(())
    }

    /// Nearest alarms by cosine similarity, best first. Index entries whose
    /// row is gone are skipped.
    pub fn vector_search_alarms(
        &self,
        query_embedding: &Array1<f32>,
        top_k: usize,
    ) -> Result<Vec<AlarmRecord>> {
        let hits = self.alarm_index.lock().search(query_embedding, top_k)?;
        let ids: Vec<i64> = hits.into_iter().map(|(id, _)| id).collect();
        let alarms = self.get_alarms(&ids)?;
        if alarms.len() < ids.len() {
            warn!(
                "Vector index returned {} alarms missing from the table; skipping them",
                ids.len() - alarms.len()
            );
        }
        Ok(alarms)
    }

    /// Replace only the embedding of an existing alarm (bulk re-embedding).
    pub fn set_alarm_embedding(&self, id: i64, embedding: &[f32]) -> Result<()> {
        self.check_embedding(embedding)?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(db_err)?;
            let exists: bool = tx
                .query_row("SELECT EXISTS(SELECT 1 FROM alarm WHERE id = ?1)", params![id], |row| {
                    row.get(0)
                })
                .map_err(db_err)?;
            if !exists {
                return Err(Error::NotFound(format!("alarm {}", id)));
            }
            write_alarm_embedding(&tx, id, embedding)?;
            tx.commit().map_err(db_err)?;
        }
        self.alarm_index
            .lock()
            .upsert(id, &Array1::from_vec(embedding.to_vec()))
    }

    /// Ids of alarms with no stored embedding.
    pub fn alarms_without_embedding(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT a.id FROM alarm a \
                 LEFT JOIN alarm_embeddings e ON e.alarm_id = a.id \
                 WHERE e.alarm_id IS NULL ORDER BY a.id",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Pinned Alarms
    // ---------------------------------------------------------------

    /// Flip the pinned state of an alarm. Returns the new state.
    pub fn toggle_pinned(&self, alarm_id: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM alarm WHERE id = ?1)",
                params![alarm_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if !exists {
            return Err(Error::NotFound(format!("alarm {}", alarm_id)));
        }

        let mut pinned = read_pinned(&tx)?;
        let now_pinned = match pinned.iter().position(|&p| p == alarm_id) {
            Some(pos) => {
                pinned.remove(pos);
                false
            }
            None => {
                pinned.push(alarm_id);
                true
            }
        };
        write_pinned(&tx, &pinned)?;
        tx.commit().map_err(db_err)?;
        Ok(now_pinned)
    }

    /// Pinned alarm ids in pin order.
    pub fn pinned_alarm_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        read_pinned(&conn)
    }

    pub fn pinned_alarms(&self) -> Result<Vec<AlarmRecord>> {
        let ids = self.pinned_alarm_ids()?;
        self.get_alarms(&ids)
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(db_err)
        };
        let total_alarms = count("SELECT COUNT(*) FROM alarm")?;
        let alarm_embeddings = count("SELECT COUNT(*) FROM alarm_embeddings")?;
        let duplicate_codes = count(
            "SELECT COUNT(*) FROM (SELECT code FROM alarm GROUP BY code HAVING COUNT(*) > 1)",
        )?;
        let manual_collections = count("SELECT COUNT(DISTINCT collection) FROM manual_chunks")?;
        let manual_chunks = count("SELECT COUNT(*) FROM manual_chunks")?;
        let threads = count("SELECT COUNT(*) FROM threads")?;
        drop(conn);

        let db_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            total_alarms,
            alarm_embeddings,
            duplicate_codes,
            manual_collections,
            manual_chunks,
            threads,
            embedding_dimension: self.embedding_dim,
            db_path: self.db_path.to_string_lossy().to_string(),
            db_size_mb: db_size as f64 / (1024.0 * 1024.0),
        })
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_alarm(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlarmRecord> {
        Ok(AlarmRecord {
            id: row.get("id")?,
            code: row.get("code")?,
            message: row.get("message")?,
            desc: row.get("desc")?,
            solution: row.get("solution")?,
            machine_type: row.get("machine_type")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

fn validate_alarm(alarm: &NewAlarm) -> Result<()> {
    if alarm.code.trim().is_empty() {
        return Err(Error::Validation("alarm code is required".into()));
    }
    if alarm.machine_type.trim().is_empty() {
        return Err(Error::Validation("machine type is required".into()));
    }
    Ok(())
}

/// Quote user text as a single FTS5 phrase.
fn fts_phrase(text: &str) -> String {
    format!("\"{}\"", text.trim().replace('"', "\"\""))
}

fn write_alarm_embedding(tx: &Transaction<'_>, alarm_id: i64, embedding: &[f32]) -> Result<()> {
    let q = QuantizedVector::quantize(embedding);
    tx.prepare_cached(
        "INSERT OR REPLACE INTO alarm_embeddings (alarm_id, embedding, scale, offset_val) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .map_err(db_err)?
    .execute(params![alarm_id, q.bytes, q.scale as f64, q.offset as f64])
    .map_err(db_err)?;
    Ok(())
}

pub(crate) fn read_quantized_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, QuantizedVector)> {
    let id: i64 = row.get(0)?;
    let bytes: Vec<u8> = row.get(1)?;
    let scale: f64 = row.get(2)?;
    let offset: f64 = row.get(3)?;
    Ok((
        id,
        QuantizedVector {
            bytes,
            scale: scale as f32,
            offset: offset as f32,
        },
    ))
}

fn read_pinned(conn: &Connection) -> Result<Vec<i64>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM key_value WHERE key = ?1",
            params![PINNED_ALARMS_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn write_pinned(conn: &Connection, ids: &[i64]) -> Result<()> {
    conn.execute(
        "INSERT INTO key_value (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![PINNED_ALARMS_KEY, serde_json::to_string(ids)?],
    )
    .map_err(db_err)?;
    Ok(())
}
