//! Streaming-message reconciliation.
//!
//! Every inbound output event resolves to a local message by
//! `streaming_message_id` (update if known, insert otherwise), with the
//! server authoritative on block order and `is_complete` freezing the
//! record. Per session, the reconciler tracks the next expected sequence:
//! a gap triggers a bounded replay request, and frames that arrive out of
//! order are buffered until the gap closes or a timeout forces them
//! through with a visible partial marker.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::debug;

use tiflis_protocol::{MessageRecord, SequencedEvent};

use crate::store::{event_record_id, ClientStore};

/// Replay attempts per gap before giving up and surfacing a partial log.
pub const GAP_REPLAY_MAX_ATTEMPTS: u32 = 3;
/// How long out-of-order frames wait for the gap to close.
pub const GAP_BUFFER_TIMEOUT_MS: u64 = 2_000;
/// Unacked user messages display as failed after this long.
pub const ACK_DEADLINE_MS: u64 = 10_000;

/// Sink for gap-recovery replay requests (wired to the command sender).
pub trait ReplayRequester: Send + Sync {
    fn request_replay(&self, session_id: &str, since_sequence: u64, limit: u32);
}

#[derive(Default)]
struct SessionCursor {
    /// Next sequence we expect; 0 means no baseline yet.
    expected_next: u64,
    /// Out-of-order frames parked until the gap closes.
    buffered: BTreeMap<u64, SequencedEvent>,
    /// Epoch ms when the current gap opened.
    gap_opened_at: Option<u64>,
    replay_attempts: u32,
}

/// Merges streamed output into the client store, in order, across devices.
pub struct StreamReconciler {
    store: Arc<ClientStore>,
    replayer: Arc<dyn ReplayRequester>,
    cursors: Mutex<HashMap<String, SessionCursor>>,
}

impl StreamReconciler {
    pub fn new(store: Arc<ClientStore>, replayer: Arc<dyn ReplayRequester>) -> Self {
        Self {
            store,
            replayer,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one live output event.
    pub fn apply_event(&self, event: SequencedEvent, now: u64) {
        let mut cursors = self.lock_cursors();
        let cursor = cursors.entry(event.session_id.clone()).or_default();

        if cursor.expected_next == 0 {
            // No baseline yet — accept whatever the stream starts with.
            cursor.expected_next = event.sequence + 1;
            drop(cursors);
            self.store.apply_event(&event);
            return;
        }

        if event.sequence < cursor.expected_next {
            // Duplicate or a refresh of something we already hold; the
            // store's idempotent upsert absorbs it.
            drop(cursors);
            self.store.apply_event(&event);
            return;
        }

        if event.sequence == cursor.expected_next {
            cursor.expected_next += 1;
            let ready = drain_ready(cursor);
            let gap_closed = cursor.buffered.is_empty();
            if gap_closed {
                cursor.gap_opened_at = None;
                cursor.replay_attempts = 0;
            }
            drop(cursors);
            self.store.apply_event(&event);
            for buffered in ready {
                self.store.apply_event(&buffered);
            }
            return;
        }

        // Gap: park the frame and ask for the missing range.
        let expected = cursor.expected_next;
        let missing = event.sequence - expected;
        cursor.buffered.insert(event.sequence, event.clone());
        if cursor.gap_opened_at.is_none() {
            cursor.gap_opened_at = Some(now);
        }
        let should_request = cursor.replay_attempts < GAP_REPLAY_MAX_ATTEMPTS;
        if should_request {
            cursor.replay_attempts += 1;
        }
        drop(cursors);
        if should_request {
            debug!(
                "Gap in {}: expected {expected}, got {} — requesting replay",
                event.session_id, event.sequence
            );
            self.replayer
                .request_replay(&event.session_id, expected - 1, missing as u32);
        }
    }

    /// Ingest a `session.replay.data` batch.
    pub fn apply_replay(&self, session_id: &str, events: Vec<SequencedEvent>) {
        let mut cursors = self.lock_cursors();
        let cursor = cursors.entry(session_id.to_string()).or_default();
        let mut to_apply = Vec::with_capacity(events.len());
        for event in events {
            if event.sequence >= cursor.expected_next {
                cursor.expected_next = event.sequence + 1;
            }
            to_apply.push(event);
        }
        to_apply.extend(drain_ready(cursor));
        if cursor.buffered.is_empty() {
            cursor.gap_opened_at = None;
            cursor.replay_attempts = 0;
        }
        drop(cursors);
        for event in to_apply {
            self.store.apply_event(&event);
        }
    }

    /// Ingest a history page (or sync snapshot window). History is
    /// authoritative for the range it covers, so the gap detector moves its
    /// baseline instead of asking for a replay.
    pub fn apply_history(
        &self,
        session_id: &str,
        history: Vec<MessageRecord>,
        newest_sequence: Option<u64>,
    ) {
        let mut cursors = self.lock_cursors();
        let cursor = cursors.entry(session_id.to_string()).or_default();
        if let Some(newest) = newest_sequence {
            if newest + 1 > cursor.expected_next {
                cursor.expected_next = newest + 1;
            }
        }
        // Anything parked inside the covered range is now redundant.
        let expected = cursor.expected_next;
        cursor.buffered.retain(|seq, _| *seq >= expected);
        let ready = drain_ready(cursor);
        if cursor.buffered.is_empty() {
            cursor.gap_opened_at = None;
            cursor.replay_attempts = 0;
        }
        drop(cursors);
        for record in history {
            self.store.apply_record(record);
        }
        for event in ready {
            self.store.apply_event(&event);
        }
    }

    /// Record a locally sent user message awaiting `message.ack`.
    pub fn register_sent(&self, record: MessageRecord, now: u64) {
        self.store.apply_local(record, now);
    }

    /// Resolve an inbound `message.ack`.
    pub fn on_ack(&self, message_id: &str) {
        self.store.resolve_ack(message_id);
    }

    /// Drive timeouts: unclosed gaps older than 2 s surface their buffered
    /// frames with a partial marker, and unacked messages older than 10 s
    /// flip to failed. Returns the ids newly marked failed.
    pub fn poll(&self, now: u64) -> Vec<String> {
        let mut forced: Vec<(String, Vec<SequencedEvent>)> = Vec::new();
        {
            let mut cursors = self.lock_cursors();
            for (session_id, cursor) in cursors.iter_mut() {
                let Some(opened) = cursor.gap_opened_at else {
                    continue;
                };
                if now.saturating_sub(opened) < GAP_BUFFER_TIMEOUT_MS {
                    continue;
                }
                let events: Vec<SequencedEvent> =
                    std::mem::take(&mut cursor.buffered).into_values().collect();
                if let Some(last) = events.last() {
                    cursor.expected_next = last.sequence + 1;
                }
                cursor.gap_opened_at = None;
                cursor.replay_attempts = 0;
                forced.push((session_id.clone(), events));
            }
        }
        for (session_id, events) in forced {
            debug!("Gap in {session_id} never closed — surfacing partial log");
            for (i, event) in events.iter().enumerate() {
                self.store.apply_event(event);
                if i == 0 {
                    self.store
                        .mark_partial(&event.session_id, &event_record_id(event));
                }
            }
        }
        self.store.fail_unacked(now, ACK_DEADLINE_MS)
    }

    /// Forget a terminated session.
    pub fn remove_session(&self, session_id: &str) {
        self.lock_cursors().remove(session_id);
        self.store.remove_session(session_id);
    }

    fn lock_cursors(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionCursor>> {
        self.cursors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Pull consecutively-numbered frames out of the buffer.
fn drain_ready(cursor: &mut SessionCursor) -> Vec<SequencedEvent> {
    let mut ready = Vec::new();
    while let Some(event) = cursor.buffered.remove(&cursor.expected_next) {
        cursor.expected_next += 1;
        ready.push(event);
    }
    ready
}
