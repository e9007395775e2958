//! Client-side session message logs.
//!
//! One ordered log per session, keyed by message id. Ingest is idempotent:
//! an event for a known id updates the record in place, and a record whose
//! `is_complete` flag is set is frozen. This is what makes at-least-once
//! delivery safe — sync snapshots, history pages, and live events can all
//! carry the same message without duplicating it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tiflis_protocol::{MessageRecord, SequencedEvent};

/// Current timestamp in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Stable record id for a streamed event: the `streaming_message_id` when
/// present, a synthetic per-sequence id otherwise (terminal frames).
pub fn event_record_id(event: &SequencedEvent) -> String {
    event
        .streaming_message_id
        .clone()
        .unwrap_or_else(|| format!("seq-{}-{}", event.session_id, event.sequence))
}

/// Outbound delivery status of a locally originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Server-originated or already acknowledged.
    Confirmed,
    /// Sent, awaiting `message.ack`; `sent_at` is epoch ms.
    PendingAck { sent_at: u64 },
    /// No ack within the deadline. Still resendable.
    Failed,
}

/// One message as the UI sees it.
#[derive(Debug, Clone)]
pub struct LocalMessage {
    pub record: MessageRecord,
    pub delivery: DeliveryState,
    /// Set when a sequence gap around this message could not be closed by
    /// replay and the log is knowingly incomplete.
    pub partial: bool,
}

/// How an ingest call changed the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    /// The record was complete; the write was ignored.
    IgnoredFrozen,
}

#[derive(Default)]
struct SessionLog {
    /// Ordered by sequence.
    messages: Vec<LocalMessage>,
    index: HashMap<String, usize>,
}

impl SessionLog {
    fn upsert(&mut self, record: MessageRecord, delivery: DeliveryState) -> Applied {
        if let Some(&i) = self.index.get(&record.id) {
            let existing = &mut self.messages[i];
            if existing.record.is_complete {
                return Applied::IgnoredFrozen;
            }
            // The server is authoritative on content and block order.
            existing.record.content = record.content;
            existing.record.content_blocks = record.content_blocks;
            existing.record.content_type = record.content_type;
            existing.record.is_complete = record.is_complete;
            existing.record.audio_input_path = record.audio_input_path;
            existing.record.audio_output_path = record.audio_output_path;
            if record.sequence > existing.record.sequence {
                existing.record.sequence = record.sequence;
            }
            return Applied::Updated;
        }

        let position = self
            .messages
            .partition_point(|m| m.record.sequence <= record.sequence);
        self.messages.insert(
            position,
            LocalMessage {
                record,
                delivery,
                partial: false,
            },
        );
        self.reindex();
        Applied::Inserted
    }

    fn reindex(&mut self) {
        self.index = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.record.id.clone(), i))
            .collect();
    }
}

/// All session logs owned by one client.
#[derive(Default)]
pub struct ClientStore {
    sessions: Mutex<HashMap<String, SessionLog>>,
}

impl ClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a server-side record (history page, sync snapshot, mirror).
    pub fn apply_record(&self, record: MessageRecord) -> Applied {
        let mut sessions = self.lock();
        sessions
            .entry(record.session_id.clone())
            .or_default()
            .upsert(record, DeliveryState::Confirmed)
    }

    /// Ingest one streamed output event, using `streaming_message_id` as
    /// the record id so every device converges on the same row.
    pub fn apply_event(&self, event: &SequencedEvent) -> Applied {
        let id = event_record_id(event);
        let record = MessageRecord {
            id,
            session_id: event.session_id.clone(),
            sequence: event.sequence,
            role: tiflis_protocol::Role::Assistant,
            content_type: event.content_type,
            content: event.content.clone(),
            content_blocks: event.content_blocks.clone(),
            audio_input_path: None,
            audio_output_path: None,
            is_complete: event.is_complete,
            created_at: event.timestamp,
        };
        let mut sessions = self.lock();
        sessions
            .entry(event.session_id.clone())
            .or_default()
            .upsert(record, DeliveryState::Confirmed)
    }

    /// Record a locally originated message awaiting its ack.
    pub fn apply_local(&self, record: MessageRecord, sent_at: u64) -> Applied {
        let mut sessions = self.lock();
        sessions
            .entry(record.session_id.clone())
            .or_default()
            .upsert(record, DeliveryState::PendingAck { sent_at })
    }

    /// Snapshot of one session's log.
    pub fn messages(&self, session_id: &str) -> Vec<LocalMessage> {
        self.lock()
            .get(session_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, session_id: &str, message_id: &str) -> Option<LocalMessage> {
        let sessions = self.lock();
        let log = sessions.get(session_id)?;
        let &i = log.index.get(message_id)?;
        Some(log.messages[i].clone())
    }

    /// Resolve a pending ack anywhere in the store. Returns whether a
    /// message flipped to confirmed.
    pub fn resolve_ack(&self, message_id: &str) -> bool {
        let mut sessions = self.lock();
        for log in sessions.values_mut() {
            if let Some(&i) = log.index.get(message_id) {
                let message = &mut log.messages[i];
                if matches!(message.delivery, DeliveryState::PendingAck { .. }) {
                    message.delivery = DeliveryState::Confirmed;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Flip pending messages older than `deadline_ms` to failed. They stay
    /// in the log and remain resendable. Returns the affected ids.
    pub fn fail_unacked(&self, now: u64, deadline_ms: u64) -> Vec<String> {
        let mut failed = Vec::new();
        let mut sessions = self.lock();
        for log in sessions.values_mut() {
            for message in &mut log.messages {
                if let DeliveryState::PendingAck { sent_at } = message.delivery {
                    if now.saturating_sub(sent_at) >= deadline_ms {
                        message.delivery = DeliveryState::Failed;
                        failed.push(message.record.id.clone());
                    }
                }
            }
        }
        failed
    }

    /// Mark a message as knowingly incomplete (unclosed gap).
    pub fn mark_partial(&self, session_id: &str, message_id: &str) {
        let mut sessions = self.lock();
        if let Some(log) = sessions.get_mut(session_id) {
            if let Some(&i) = log.index.get(message_id) {
                log.messages[i].partial = true;
            }
        }
    }

    /// Drop a terminated session's log.
    pub fn remove_session(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionLog>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiflis_protocol::{ContentBlock, ContentType, Role};

    fn record(id: &str, seq: u64, content: &str, complete: bool) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            session_id: "claude-abc12345".into(),
            sequence: seq,
            role: Role::Assistant,
            content_type: ContentType::Text,
            content: content.into(),
            content_blocks: vec![ContentBlock::text("b1", content)],
            audio_input_path: None,
            audio_output_path: None,
            is_complete: complete,
            created_at: 0,
        }
    }

    #[test]
    fn same_id_from_two_paths_is_one_record() {
        let store = ClientStore::new();
        // History delivered it first...
        assert_eq!(store.apply_record(record("s-1", 5, "old", false)), Applied::Inserted);
        // ...then a live event updates the same row.
        assert_eq!(store.apply_record(record("s-1", 6, "new", false)), Applied::Updated);
        let messages = store.messages("claude-abc12345");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].record.content, "new");
        assert_eq!(messages[0].record.sequence, 6);
    }

    #[test]
    fn complete_records_freeze() {
        let store = ClientStore::new();
        store.apply_record(record("s-1", 5, "final", true));
        assert_eq!(
            store.apply_record(record("s-1", 6, "late", false)),
            Applied::IgnoredFrozen
        );
        assert_eq!(
            store.get("claude-abc12345", "s-1").unwrap().record.content,
            "final"
        );
    }

    #[test]
    fn logs_stay_sequence_ordered() {
        let store = ClientStore::new();
        store.apply_record(record("m-3", 3, "c", true));
        store.apply_record(record("m-1", 1, "a", true));
        store.apply_record(record("m-2", 2, "b", true));
        let seqs: Vec<u64> = store
            .messages("claude-abc12345")
            .iter()
            .map(|m| m.record.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn ack_lifecycle() {
        let store = ClientStore::new();
        let mut rec = record("m-1", 1, "hi", true);
        rec.role = Role::User;
        store.apply_local(rec, 1_000);

        // Not yet due.
        assert!(store.fail_unacked(5_000, 10_000).is_empty());
        // Over the deadline: failed but still present and resendable.
        let failed = store.fail_unacked(11_001, 10_000);
        assert_eq!(failed, vec!["m-1"]);
        let message = store.get("claude-abc12345", "m-1").unwrap();
        assert_eq!(message.delivery, DeliveryState::Failed);

        // A late ack does not resurrect a failed message.
        assert!(!store.resolve_ack("m-1"));
    }

    #[test]
    fn ack_resolves_pending() {
        let store = ClientStore::new();
        let mut rec = record("m-1", 1, "hi", true);
        rec.role = Role::User;
        store.apply_local(rec, 1_000);
        assert!(store.resolve_ack("m-1"));
        assert_eq!(
            store.get("claude-abc12345", "m-1").unwrap().delivery,
            DeliveryState::Confirmed
        );
        // Nothing to fail afterwards.
        assert!(store.fail_unacked(u64::MAX, 10_000).is_empty());
    }
}
