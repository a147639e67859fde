//! Database schema SQL.

/// Core tables: alarms, alarm embeddings, manual chunks, conversation state.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS alarm (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    desc TEXT NOT NULL,
    solution TEXT,
    machine_type TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alarm_code ON alarm(code);
CREATE INDEX IF NOT EXISTS idx_alarm_machine_type ON alarm(machine_type);

CREATE TABLE IF NOT EXISTS alarm_embeddings (
    alarm_id INTEGER PRIMARY KEY REFERENCES alarm(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    scale REAL NOT NULL,
    offset_val REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS manual_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    page INTEGER NOT NULL,
    media_type TEXT NOT NULL,
    file_name TEXT NOT NULL,
    embedding BLOB NOT NULL,
    scale REAL NOT NULL,
    offset_val REAL NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_manual_chunks_collection ON manual_chunks(collection, chunk_index);

CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    messages_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (thread_id, seq)
);

CREATE TABLE IF NOT EXISTS key_value (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// FTS5 trigram index over the searchable alarm fields (substring matching,
/// needs at least 3 characters per query).
pub const FTS_SCHEMA_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS alarm_fts USING fts5(
    code, message, desc,
    content='alarm', content_rowid='id',
    tokenize='trigram'
);
"#;

/// Triggers to keep the FTS index in sync with the alarm table.
pub const FTS_TRIGGERS_SQL: &str = r#"
CREATE TRIGGER IF NOT EXISTS alarm_ai AFTER INSERT ON alarm BEGIN
    INSERT INTO alarm_fts(rowid, code, message, desc)
    VALUES (new.id, new.code, new.message, new.desc);
END;

CREATE TRIGGER IF NOT EXISTS alarm_ad AFTER DELETE ON alarm BEGIN
    INSERT INTO alarm_fts(alarm_fts, rowid, code, message, desc)
    VALUES ('delete', old.id, old.code, old.message, old.desc);
END;

CREATE TRIGGER IF NOT EXISTS alarm_au AFTER UPDATE ON alarm BEGIN
    INSERT INTO alarm_fts(alarm_fts, rowid, code, message, desc)
    VALUES ('delete', old.id, old.code, old.message, old.desc);
    INSERT INTO alarm_fts(rowid, code, message, desc)
    VALUES (new.id, new.code, new.message, new.desc);
END;
"#;
