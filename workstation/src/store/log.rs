//! Durable SQLite message log.
//!
//! # Schema
//! - `sessions`: one row per session ever created.
//! - `messages`: the per-session ordered log; `(session_id, sequence)` is
//!   unique and sequences are allocated inside the insert transaction, so
//!   the log is gapless.
//! - `subscriptions`: persistent (device_id, session_id) edges restored on
//!   re-authentication.
//!
//! # Durability settings
//! Applied at open: WAL, synchronous=NORMAL, foreign_keys=ON.
//!
//! # Idempotent ingest
//! `append` treats a write for an existing `id` as an update: content and
//! blocks overwrite, `is_complete` may go false→true, and a message that is
//! already complete is frozen — further writes return the stored row
//! unchanged.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use tiflis_protocol::{
    AudioDirection, ContentBlock, ContentType, MessageRecord, Role, SessionInfo, SessionStatus,
};

use crate::util::now_ms;

/// Hard cap on one history page.
pub const HISTORY_PAGE_MAX: u32 = 50;
/// Hard cap on one replay batch.
pub const REPLAY_LIMIT_MAX: u32 = 1000;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Corrupt(s) => write!(f, "Corrupt record: {s}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

/// Fields of a message write; sequence and timestamps are allocated by the
/// store.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content_type: ContentType,
    pub content: String,
    pub content_blocks: Vec<ContentBlock>,
    pub is_complete: bool,
}

/// One page of history plus pagination state.
#[derive(Debug)]
pub struct HistoryPage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
    pub oldest_sequence: Option<u64>,
    pub newest_sequence: Option<u64>,
}

/// The durable message log for one workstation.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                type          TEXT NOT NULL,
                workspace     TEXT,
                project       TEXT,
                worktree      TEXT,
                working_dir   TEXT NOT NULL,
                status        TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                terminated_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS messages (
                id                TEXT PRIMARY KEY,
                session_id        TEXT NOT NULL REFERENCES sessions(id),
                sequence          INTEGER NOT NULL,
                role              TEXT NOT NULL,
                content_type      TEXT NOT NULL,
                content           TEXT NOT NULL,
                content_blocks    TEXT,
                audio_input_path  TEXT,
                audio_output_path TEXT,
                is_complete       INTEGER NOT NULL,
                created_at        INTEGER NOT NULL,
                UNIQUE (session_id, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_seq
                ON messages(session_id, sequence);
            CREATE TABLE IF NOT EXISTS subscriptions (
                id            TEXT PRIMARY KEY,
                device_id     TEXT NOT NULL,
                session_id    TEXT NOT NULL,
                subscribed_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Poisoning only happens if a panic escaped a prior critical section;
    // the connection itself stays usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------

    pub fn upsert_session(&self, info: &SessionInfo) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sessions (id, type, workspace, project, worktree, working_dir, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
            params![
                info.id,
                info.kind.as_str(),
                info.workspace,
                info.project,
                info.worktree,
                info.working_dir,
                info.status.as_str(),
                info.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn mark_session_terminated(&self, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE sessions SET status = ?2, terminated_at = ?3 WHERE id = ?1",
            params![session_id, SessionStatus::Terminated.as_str(), now_ms()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------

    /// Append or update a message.
    ///
    /// New ids get the next sequence for their session, allocated inside the
    /// same transaction as the insert. Existing ids are updated in place
    /// (streaming); once `is_complete` is set the row is frozen and further
    /// writes are ignored.
    pub fn append(&self, draft: &MessageDraft) -> Result<MessageRecord, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<(u64, bool, u64)> = tx
            .query_row(
                "SELECT sequence, is_complete, created_at FROM messages WHERE id = ?1",
                params![draft.id],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, u64>(2)?,
                    ))
                },
            )
            .optional()?;

        let blocks_json = blocks_to_json(&draft.content_blocks);

        if let Some((_, true, _)) = existing {
            // Frozen — return the stored row untouched.
            drop(tx);
            drop(conn);
            return self
                .get_message(&draft.id)?
                .ok_or_else(|| StoreError::Corrupt(format!("message {} vanished", draft.id)));
        }

        let record = match existing {
            Some((sequence, _, created_at)) => {
                tx.execute(
                    "UPDATE messages
                     SET content = ?2, content_type = ?3, content_blocks = ?4, is_complete = ?5
                     WHERE id = ?1",
                    params![
                        draft.id,
                        draft.content,
                        draft.content_type.as_str(),
                        blocks_json,
                        draft.is_complete,
                    ],
                )?;
                MessageRecord {
                    id: draft.id.clone(),
                    session_id: draft.session_id.clone(),
                    sequence,
                    role: draft.role,
                    content_type: draft.content_type,
                    content: draft.content.clone(),
                    content_blocks: draft.content_blocks.clone(),
                    audio_input_path: None,
                    audio_output_path: None,
                    is_complete: draft.is_complete,
                    created_at,
                }
            }
            None => {
                let sequence: u64 = tx.query_row(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?1",
                    params![draft.session_id],
                    |row| row.get(0),
                )?;
                let created_at = now_ms();
                tx.execute(
                    "INSERT INTO messages
                       (id, session_id, sequence, role, content_type, content, content_blocks, is_complete, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        draft.id,
                        draft.session_id,
                        sequence,
                        draft.role.as_str(),
                        draft.content_type.as_str(),
                        draft.content,
                        blocks_json,
                        draft.is_complete,
                        created_at,
                    ],
                )?;
                MessageRecord {
                    id: draft.id.clone(),
                    session_id: draft.session_id.clone(),
                    sequence,
                    role: draft.role,
                    content_type: draft.content_type,
                    content: draft.content.clone(),
                    content_blocks: draft.content_blocks.clone(),
                    audio_input_path: None,
                    audio_output_path: None,
                    is_complete: draft.is_complete,
                    created_at,
                }
            }
        };

        tx.commit()?;
        Ok(record)
    }

    /// Record where a message's audio blob landed on disk.
    pub fn set_audio_path(
        &self,
        message_id: &str,
        direction: AudioDirection,
        path: &str,
    ) -> Result<(), StoreError> {
        let column = match direction {
            AudioDirection::Input => "audio_input_path",
            AudioDirection::Output => "audio_output_path",
        };
        self.conn().execute(
            &format!("UPDATE messages SET {column} = ?2 WHERE id = ?1"),
            params![message_id, path],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sequence, role, content_type, content, content_blocks,
                    audio_input_path, audio_output_path, is_complete, created_at
             FROM messages WHERE id = ?1",
        )?;
        let record = stmt
            .query_row(params![id], row_to_record)
            .optional()?
            .map(finish_record)
            .transpose()?;
        Ok(record)
    }

    /// One history page, newest-first pagination via `before_sequence`,
    /// returned in ascending order. `limit` is clamped to [`HISTORY_PAGE_MAX`].
    pub fn read_page(
        &self,
        session_id: &str,
        before_sequence: Option<u64>,
        limit: u32,
    ) -> Result<HistoryPage, StoreError> {
        let limit = limit.clamp(1, HISTORY_PAGE_MAX) as usize;
        // SQLite integers are signed; cap the open-ended bound accordingly.
        #[allow(clippy::cast_sign_loss)]
        let before = before_sequence.unwrap_or(i64::MAX as u64);

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sequence, role, content_type, content, content_blocks,
                    audio_input_path, audio_output_path, is_complete, created_at
             FROM messages
             WHERE session_id = ?1 AND sequence < ?2
             ORDER BY sequence DESC
             LIMIT ?3",
        )?;
        #[allow(clippy::cast_possible_truncation)]
        let mut rows: Vec<MessageRecord> = stmt
            .query_map(params![session_id, before, (limit + 1) as u32], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(finish_record)
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        rows.reverse();

        let (oldest, newest) = self.sequence_bounds_locked(&conn, session_id)?;
        Ok(HistoryPage {
            messages: rows,
            has_more,
            oldest_sequence: oldest,
            newest_sequence: newest,
        })
    }

    /// Messages with `sequence > since`, ascending, capped at
    /// [`REPLAY_LIMIT_MAX`]. `has_more` is true only on cap truncation.
    pub fn replay_since(
        &self,
        session_id: &str,
        since: u64,
        limit: u32,
    ) -> Result<(Vec<MessageRecord>, bool), StoreError> {
        let limit = limit.clamp(1, REPLAY_LIMIT_MAX) as usize;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sequence, role, content_type, content, content_blocks,
                    audio_input_path, audio_output_path, is_complete, created_at
             FROM messages
             WHERE session_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC
             LIMIT ?3",
        )?;
        #[allow(clippy::cast_possible_truncation)]
        let mut rows: Vec<MessageRecord> = stmt
            .query_map(params![session_id, since, (limit + 1) as u32], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(finish_record)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        Ok((rows, has_more))
    }

    /// Messages created at or after `timestamp`, ascending.
    pub fn replay_since_timestamp(
        &self,
        session_id: &str,
        timestamp: u64,
        limit: u32,
    ) -> Result<(Vec<MessageRecord>, bool), StoreError> {
        let since: Option<u64> = self
            .conn()
            .query_row(
                "SELECT MAX(sequence) FROM messages
                 WHERE session_id = ?1 AND created_at < ?2",
                params![session_id, timestamp],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        self.replay_since(session_id, since.unwrap_or(0), limit)
    }

    /// `(oldest, newest)` sequence in a session's log.
    pub fn sequence_bounds(
        &self,
        session_id: &str,
    ) -> Result<(Option<u64>, Option<u64>), StoreError> {
        let conn = self.conn();
        self.sequence_bounds_locked(&conn, session_id)
    }

    fn sequence_bounds_locked(
        &self,
        conn: &Connection,
        session_id: &str,
    ) -> Result<(Option<u64>, Option<u64>), StoreError> {
        let bounds: (Option<u64>, Option<u64>) = conn.query_row(
            "SELECT MIN(sequence), MAX(sequence) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(bounds)
    }

    // -------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------

    pub fn add_subscription(&self, device_id: &str, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO subscriptions (id, device_id, session_id, subscribed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                format!("{device_id}:{session_id}"),
                device_id,
                session_id,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub fn remove_subscription(&self, device_id: &str, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM subscriptions WHERE id = ?1",
            params![format!("{device_id}:{session_id}")],
        )?;
        Ok(())
    }

    pub fn subscriptions_for_device(&self, device_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id FROM subscriptions WHERE device_id = ?1 ORDER BY subscribed_at",
        )?;
        let ids = stmt
            .query_map(params![device_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn remove_subscriptions_for_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM subscriptions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}

type RawRow = (
    String,
    String,
    u64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    u64,
);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn finish_record(raw: RawRow) -> Result<MessageRecord, StoreError> {
    let (
        id,
        session_id,
        sequence,
        role,
        content_type,
        content,
        blocks,
        audio_input_path,
        audio_output_path,
        is_complete,
        created_at,
    ) = raw;
    Ok(MessageRecord {
        id,
        session_id,
        sequence,
        role: Role::from_str(&role).map_err(StoreError::Corrupt)?,
        content_type: ContentType::from_str(&content_type).map_err(StoreError::Corrupt)?,
        content,
        content_blocks: blocks
            .as_deref()
            .map(json_to_blocks)
            .transpose()?
            .unwrap_or_default(),
        audio_input_path,
        audio_output_path,
        is_complete,
        created_at,
    })
}

fn blocks_to_json(blocks: &[ContentBlock]) -> Option<String> {
    if blocks.is_empty() {
        None
    } else {
        serde_json::to_string(blocks).ok()
    }
}

fn json_to_blocks(json: &str) -> Result<Vec<ContentBlock>, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt(format!("content_blocks: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiflis_protocol::SessionKind;

    fn store_with_session(session_id: &str) -> MessageStore {
        let store = MessageStore::open_in_memory().unwrap();
        store
            .upsert_session(&SessionInfo {
                id: session_id.into(),
                kind: SessionKind::Agent,
                status: SessionStatus::Active,
                working_dir: "/".into(),
                workspace: None,
                project: None,
                worktree: None,
                agent_name: Some("claude".into()),
                created_at: 0,
                last_activity_at: 0,
            })
            .unwrap();
        store
    }

    fn draft(id: &str, session: &str, content: &str, complete: bool) -> MessageDraft {
        MessageDraft {
            id: id.into(),
            session_id: session.into(),
            role: Role::Assistant,
            content_type: ContentType::Text,
            content: content.into(),
            content_blocks: vec![ContentBlock::text("b1", content)],
            is_complete: complete,
        }
    }

    #[test]
    fn sequences_are_gapless_and_strictly_increasing() {
        let store = store_with_session("s");
        for i in 0..10 {
            let rec = store.append(&draft(&format!("m-{i}"), "s", "x", true)).unwrap();
            assert_eq!(rec.sequence, i + 1);
        }
        let (oldest, newest) = store.sequence_bounds("s").unwrap();
        assert_eq!(oldest, Some(1));
        assert_eq!(newest, Some(10));
    }

    #[test]
    fn append_same_id_updates_in_place() {
        let store = store_with_session("s");
        let first = store.append(&draft("m-1", "s", "partial", false)).unwrap();
        let second = store.append(&draft("m-1", "s", "full", false)).unwrap();
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(second.content, "full");
        // No second row was created.
        let (_, newest) = store.sequence_bounds("s").unwrap();
        assert_eq!(newest, Some(1));
    }

    #[test]
    fn complete_messages_are_frozen() {
        let store = store_with_session("s");
        store.append(&draft("m-1", "s", "final", true)).unwrap();
        let after = store.append(&draft("m-1", "s", "overwrite", false)).unwrap();
        assert_eq!(after.content, "final");
        assert!(after.is_complete);
    }

    #[test]
    fn pagination_respects_limit_and_has_more() {
        let store = store_with_session("s");
        for i in 0..30 {
            store.append(&draft(&format!("m-{i}"), "s", "x", true)).unwrap();
        }
        let page = store.read_page("s", None, 20).unwrap();
        assert_eq!(page.messages.len(), 20);
        assert!(page.has_more);
        assert_eq!(page.messages[0].sequence, 11);
        assert_eq!(page.messages[19].sequence, 30);
        assert_eq!(page.newest_sequence, Some(30));

        let older = store.read_page("s", Some(11), 20).unwrap();
        assert_eq!(older.messages.len(), 10);
        assert!(!older.has_more);
        assert_eq!(older.messages[0].sequence, 1);
    }

    #[test]
    fn page_limit_is_capped() {
        let store = store_with_session("s");
        for i in 0..60 {
            store.append(&draft(&format!("m-{i}"), "s", "x", true)).unwrap();
        }
        let page = store.read_page("s", None, 500).unwrap();
        assert_eq!(page.messages.len(), HISTORY_PAGE_MAX as usize);
    }

    #[test]
    fn replay_is_cumulative() {
        let store = store_with_session("s");
        for i in 0..12 {
            store.append(&draft(&format!("m-{i}"), "s", "x", true)).unwrap();
        }
        let (all, _) = store.replay_since("s", 3, 100).unwrap();
        let (head, _) = store.replay_since("s", 3, 100).unwrap();
        let mid = head[4].sequence;
        let (tail, _) = store.replay_since("s", mid, 100).unwrap();
        let combined: Vec<u64> = head[..5]
            .iter()
            .chain(tail.iter())
            .map(|r| r.sequence)
            .collect();
        let expected: Vec<u64> = all.iter().map(|r| r.sequence).collect();
        assert_eq!(combined, expected);
    }

    #[test]
    fn subscriptions_round_trip_and_cascade() {
        let store = store_with_session("s");
        store.add_subscription("D1", "s").unwrap();
        store.add_subscription("D1", "s").unwrap(); // idempotent
        store.add_subscription("D2", "s").unwrap();
        assert_eq!(store.subscriptions_for_device("D1").unwrap(), vec!["s"]);

        store.remove_subscriptions_for_session("s").unwrap();
        assert!(store.subscriptions_for_device("D1").unwrap().is_empty());
        assert!(store.subscriptions_for_device("D2").unwrap().is_empty());
    }

    #[test]
    fn audio_paths_attach_to_messages() {
        let store = store_with_session("s");
        store.append(&draft("m-1", "s", "x", true)).unwrap();
        store
            .set_audio_path("m-1", AudioDirection::Output, "/data/audio/output/s/m-1.opus")
            .unwrap();
        let rec = store.get_message("m-1").unwrap().unwrap();
        assert_eq!(
            rec.audio_output_path.as_deref(),
            Some("/data/audio/output/s/m-1.opus")
        );
        assert!(rec.audio_input_path.is_none());
    }

    #[test]
    fn blocks_survive_the_round_trip() {
        let store = store_with_session("s");
        store.append(&draft("m-1", "s", "hello", true)).unwrap();
        let rec = store.get_message("m-1").unwrap().unwrap();
        assert_eq!(rec.content_blocks.len(), 1);
        assert_eq!(rec.content_blocks[0].id, "b1");
    }
}
