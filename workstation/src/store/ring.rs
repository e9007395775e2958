//! Bounded circular buffer for terminal output.
//!
//! Each terminal session keeps its most recent N PTY frames in memory; the
//! buffer is intentionally not durable across a restart. Entries live in a
//! fixed slot array written round-robin, so the physical array is generally
//! *not* in chronological order — reads sort by timestamp before returning.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::util::now_ms;

/// One buffered PTY frame.
#[derive(Debug, Clone)]
pub struct RingEntry {
    /// Monotonically increasing per-session sequence number.
    pub sequence: u64,
    /// Epoch milliseconds.
    pub timestamp: u64,
    /// Raw PTY bytes, lossy UTF-8.
    pub data: String,
}

/// Circular store of the most recent `capacity` frames.
pub struct TerminalRing {
    slots: Vec<Option<RingEntry>>,
    write_idx: usize,
    next_seq: u64,
}

impl TerminalRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            write_idx: 0,
            next_seq: 1,
        }
    }

    /// Append a frame, allocating its sequence number and overwriting the
    /// oldest slot when full.
    pub fn push(&mut self, data: String, timestamp: u64) -> RingEntry {
        let entry = RingEntry {
            sequence: self.next_seq,
            timestamp,
            data,
        };
        self.next_seq += 1;
        self.slots[self.write_idx] = Some(entry.clone());
        self.write_idx = (self.write_idx + 1) % self.slots.len();
        entry
    }

    /// Sequence number the next push will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Oldest retained sequence number, if any entries exist.
    pub fn oldest_sequence(&self) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .map(|e| e.sequence)
            .min()
    }

    /// All retained entries in chronological order (timestamp, then
    /// sequence as tiebreak). The slot array itself may be rotated.
    pub fn read_all(&self) -> Vec<RingEntry> {
        let mut entries: Vec<RingEntry> = self.slots.iter().flatten().cloned().collect();
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });
        entries
    }

    /// Entries with `sequence > since`, capped at `limit`.
    ///
    /// Returns `(entries, has_more)` where `has_more` is true only when the
    /// cap truncated entries that are still retained. Entries already
    /// evicted are simply unavailable and do not set `has_more`.
    pub fn read_since(&self, since: u64, limit: usize) -> (Vec<RingEntry>, bool) {
        let mut entries = self.read_all();
        entries.retain(|e| e.sequence > since);
        let has_more = entries.len() > limit;
        entries.truncate(limit);
        (entries, has_more)
    }
}

/// Per-session ring buffers, each behind its own lock.
#[derive(Clone)]
pub struct RingStore {
    rings: Arc<Mutex<HashMap<String, Arc<Mutex<TerminalRing>>>>>,
    capacity: usize,
}

impl RingStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    async fn ring(&self, session_id: &str) -> Arc<Mutex<TerminalRing>> {
        let mut rings = self.rings.lock().await;
        Arc::clone(
            rings
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TerminalRing::new(self.capacity)))),
        )
    }

    /// Append a frame to a session's ring, allocating its sequence.
    pub async fn push(&self, session_id: &str, data: String) -> RingEntry {
        let ring = self.ring(session_id).await;
        let mut ring = ring.lock().await;
        ring.push(data, now_ms())
    }

    /// Chronologically ordered replay from a session's ring.
    pub async fn read_since(
        &self,
        session_id: &str,
        since: u64,
        limit: usize,
    ) -> (Vec<RingEntry>, bool) {
        let ring = self.ring(session_id).await;
        let ring = ring.lock().await;
        ring.read_since(since, limit)
    }

    /// Drop a terminated session's buffer.
    pub async fn remove(&self, session_id: &str) {
        self.rings.lock().await.remove(session_id);
    }
}
