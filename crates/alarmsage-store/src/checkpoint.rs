//! Conversation threads and their turn-boundary checkpoints.

use rusqlite::{params, OptionalExtension};

use crate::sqlite::{db_err, now_millis, SqliteStore};
use crate::types::{Checkpoint, ThreadSummary};
use alarmsage_core::{Error, Message, Result};

/// Title given to a thread whose summarization call failed.
pub const PLACEHOLDER_TITLE: &str = "New conversation";

impl SqliteStore {
    /// Persist the full message list of a finished turn.
    ///
    /// Creates the thread row on first save (with `title`, or the placeholder),
    /// bumps `updated_at`, and appends checkpoint `seq + 1`, all in one
    /// transaction. Returns the new sequence number.
    pub fn save_turn(
        &self,
        thread_id: &str,
        title: Option<&str>,
        messages: &[Message],
    ) -> Result<i64> {
        alarmsage_core::message::validate_complete(messages)?;
        let messages_json = serde_json::to_string(messages)?;
        let now = now_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(PLACEHOLDER_TITLE);
        tx.execute(
            "INSERT INTO threads (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            params![thread_id, title, now],
        )
        .map_err(db_err)?;

        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        tx.execute(
            "INSERT INTO checkpoints (thread_id, seq, messages_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![thread_id, seq, messages_json, now],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(seq)
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadSummary>> {
        let conn = self.conn.lock();
        let thread = conn
            .prepare_cached("SELECT id, title, created_at, updated_at FROM threads WHERE id = ?1")
            .map_err(db_err)?
            .query_row(params![thread_id], row_to_thread)
            .optional()
            .map_err(db_err)?;
        Ok(thread)
    }

    /// All threads, most recently updated first.
    pub fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, title, created_at, updated_at FROM threads \
                 ORDER BY updated_at DESC, id",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_thread).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.load_checkpoint(
            "SELECT thread_id, seq, messages_json, created_at FROM checkpoints \
             WHERE thread_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![thread_id],
        )
    }

    pub fn checkpoint_at(&self, thread_id: &str, seq: i64) -> Result<Option<Checkpoint>> {
        self.load_checkpoint(
            "SELECT thread_id, seq, messages_json, created_at FROM checkpoints \
             WHERE thread_id = ?1 AND seq = ?2",
            params![thread_id, seq],
        )
    }

    /// Messages of the latest checkpoint, or empty for an unknown thread.
    pub fn thread_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .latest_checkpoint(thread_id)?
            .map(|cp| cp.messages)
            .unwrap_or_default())
    }

    /// Delete a thread and all of its checkpoints.
    pub fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM threads WHERE id = ?1", params![thread_id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    fn load_checkpoint(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Checkpoint>> {
        let row = {
            let conn = self.conn.lock();
            let row = conn
                .prepare_cached(sql)
                .map_err(db_err)?
                .query_row(params, |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .optional()
                .map_err(db_err)?;
            row
        };

        let Some((thread_id, seq, json, created_at)) = row else {
            return Ok(None);
        };
        let messages: Vec<Message> = serde_json::from_str(&json).map_err(|e| {
            Error::Consistency(format!(
                "checkpoint {}#{} is unreadable: {}",
                thread_id, seq, e
            ))
        })?;
        Ok(Some(Checkpoint {
            thread_id,
            seq,
            messages,
            created_at,
        }))
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadSummary> {
    Ok(ThreadSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::tests::test_store;
    use alarmsage_core::ToolCall;

    fn turn(question: &str, answer: &str) -> Vec<Message> {
        vec![
            Message::human(question),
            Message::Ai {
                id: format!("ai-{}", question),
                text: answer.into(),
                tool_calls: vec![],
            },
        ]
    }

    #[test]
    fn test_first_save_creates_thread_with_title() {
        let (store, _dir) = test_store();
        let seq = store
            .save_turn("thr_1", Some("Spindle alarm"), &turn("q1", "a1"))
            .unwrap();
        assert_eq!(seq, 1);

        let thread = store.get_thread("thr_1").unwrap().unwrap();
        assert_eq!(thread.title, "Spindle alarm");
        assert_eq!(store.thread_messages("thr_1").unwrap().len(), 2);
    }

    #[test]
    fn test_later_saves_keep_title_and_version() {
        let (store, _dir) = test_store();
        let mut messages = turn("q1", "a1");
        store.save_turn("thr_1", Some("First"), &messages).unwrap();
        messages.extend(turn("q2", "a2"));
        let seq = store.save_turn("thr_1", Some("Ignored"), &messages).unwrap();
        assert_eq!(seq, 2);

        assert_eq!(store.get_thread("thr_1").unwrap().unwrap().title, "First");
        assert_eq!(store.checkpoint_at("thr_1", 1).unwrap().unwrap().messages.len(), 2);
        let latest = store.latest_checkpoint("thr_1").unwrap().unwrap();
        assert_eq!(latest.seq, 2);
        assert_eq!(latest.messages, messages);
    }

    #[test]
    fn test_missing_title_uses_placeholder() {
        let (store, _dir) = test_store();
        store.save_turn("thr_1", None, &turn("q", "a")).unwrap();
        assert_eq!(store.get_thread("thr_1").unwrap().unwrap().title, PLACEHOLDER_TITLE);
    }

    #[test]
    fn test_unanswered_tool_call_is_not_saved() {
        let (store, _dir) = test_store();
        let messages = vec![
            Message::human("q"),
            Message::Ai {
                id: "ai".into(),
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "find_info_from_manual".into(),
                    arguments: serde_json::json!({"question": "q"}),
                }],
            },
        ];
        assert!(matches!(
            store.save_turn("thr_1", None, &messages),
            Err(Error::Consistency(_))
        ));
        assert!(store.get_thread("thr_1").unwrap().is_none());
    }

    #[test]
    fn test_unknown_thread_has_no_messages() {
        let (store, _dir) = test_store();
        assert!(store.latest_checkpoint("nope").unwrap().is_none());
        assert!(store.thread_messages("nope").unwrap().is_empty());
    }

    #[test]
    fn test_list_threads_most_recent_first() {
        let (store, _dir) = test_store();
        store.save_turn("thr_a", Some("A"), &turn("q", "a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save_turn("thr_b", Some("B"), &turn("q", "a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut more = turn("q", "a");
        more.extend(turn("q2", "a2"));
        store.save_turn("thr_a", None, &more).unwrap();

        let ids: Vec<_> = store.list_threads().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["thr_a", "thr_b"]);

        assert!(store.delete_thread("thr_a").unwrap());
        assert!(store.latest_checkpoint("thr_a").unwrap().is_none());
    }
}
