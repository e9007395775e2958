//! Durable and in-memory storage.
//!
//! Two stores cooperate: the SQLite message log holds agent/supervisor
//! output, user commands, and transcriptions with per-session gapless
//! sequences; the terminal ring buffer keeps the most recent PTY frames in
//! memory only. Audio blobs live on the filesystem next to the database.

pub mod audio;
pub mod log;
pub mod ring;

pub use audio::AudioStore;
pub use log::{HistoryPage, MessageDraft, MessageStore, StoreError};
pub use ring::{RingEntry, RingStore, TerminalRing};
