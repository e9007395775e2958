//! On-demand audio mediation.
//!
//! Voice blobs live on the workstation; messages only carry metadata.
//! Playback asks the mediator, which serves from its in-memory cache or
//! issues a single `audio.request` per message id no matter how many
//! callers are waiting (single-flight). Errors and timeouts resolve every
//! waiter with an empty result — the caller decides what to surface.
//!
//! Playback and recording are mutually exclusive on a device: starting a
//! recording stops playback, and playback requests made while recording
//! are suppressed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use tracing::debug;

use tiflis_protocol::{AudioDirection, ClientMessage};

/// Pending `audio.request`s older than this resolve empty.
pub const AUDIO_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Invoked with the decoded bytes, or `None` on error/timeout/suppression.
pub type AudioCallback = Box<dyn FnOnce(Option<Arc<Vec<u8>>>) + Send>;

struct PendingRequest {
    callbacks: Vec<AudioCallback>,
    requested_at: u64,
}

/// Cache + single-flight request broker for message audio.
pub struct AudioMediator {
    cache: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    recording: AtomicBool,
    playing: Mutex<Option<String>>,
}

impl AudioMediator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            recording: AtomicBool::new(false),
            playing: Mutex::new(None),
        }
    }

    /// Request playback of a message's audio.
    ///
    /// Returns the `audio.request` frame to send when this call is the
    /// first in flight for the id; `None` when the cache answered, another
    /// request is already pending, or playback is suppressed.
    pub fn play_audio_for_message(
        &self,
        message_id: &str,
        direction: AudioDirection,
        now: u64,
        callback: AudioCallback,
    ) -> Option<ClientMessage> {
        if self.recording.load(Ordering::SeqCst) {
            debug!("Playback of {message_id} suppressed while recording");
            callback(None);
            return None;
        }

        if let Some(bytes) = self.lock_cache().get(message_id).cloned() {
            *self.lock_playing() = Some(message_id.to_string());
            callback(Some(bytes));
            return None;
        }

        let mut pending = self.lock_pending();
        if let Some(entry) = pending.get_mut(message_id) {
            entry.callbacks.push(callback);
            return None;
        }
        pending.insert(
            message_id.to_string(),
            PendingRequest {
                callbacks: vec![callback],
                requested_at: now,
            },
        );
        Some(ClientMessage::AudioRequest {
            message_id: message_id.to_string(),
            direction,
        })
    }

    /// Resolve an inbound `audio.response`. `data` is the base64 payload,
    /// absent on server-side failure.
    pub fn on_response(&self, message_id: &str, data: Option<&str>) {
        let decoded = data.and_then(|b64| {
            base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| debug!("Audio for {message_id} undecodable: {e}"))
                .ok()
        });
        let bytes = decoded.map(Arc::new);
        if let Some(bytes) = &bytes {
            self.lock_cache()
                .insert(message_id.to_string(), Arc::clone(bytes));
            *self.lock_playing() = Some(message_id.to_string());
        }

        let callbacks = self
            .lock_pending()
            .remove(message_id)
            .map(|p| p.callbacks)
            .unwrap_or_default();
        for callback in callbacks {
            callback(bytes.clone());
        }
    }

    /// Expire pending requests past the deadline, resolving waiters empty.
    pub fn poll(&self, now: u64) {
        let expired: Vec<(String, Vec<AudioCallback>)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now.saturating_sub(p.requested_at) >= AUDIO_REQUEST_TIMEOUT_MS)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p.callbacks)))
                .collect()
        };
        for (id, callbacks) in expired {
            debug!("Audio request for {id} timed out");
            for callback in callbacks {
                callback(None);
            }
        }
    }

    /// Begin recording; stops any playback.
    pub fn start_recording(&self) {
        self.recording.store(true, Ordering::SeqCst);
        *self.lock_playing() = None;
    }

    pub fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Message currently playing, if any.
    pub fn current_playback(&self) -> Option<String> {
        self.lock_playing().clone()
    }

    pub fn stop_playback(&self) {
        *self.lock_playing() = None;
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Vec<u8>>>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_playing(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.playing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for AudioMediator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collecting_callback(
        results: &Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    ) -> AudioCallback {
        let results = Arc::clone(results);
        Box::new(move |bytes| {
            results
                .lock()
                .unwrap()
                .push(bytes.map(|b| b.as_ref().clone()));
        })
    }

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn single_flight_coalesces_concurrent_requests() {
        let mediator = AudioMediator::new();
        let results = Arc::new(Mutex::new(Vec::new()));

        let first = mediator.play_audio_for_message(
            "s-2",
            AudioDirection::Output,
            0,
            collecting_callback(&results),
        );
        assert!(matches!(first, Some(ClientMessage::AudioRequest { .. })));

        // Second caller piggybacks on the in-flight request.
        let second = mediator.play_audio_for_message(
            "s-2",
            AudioDirection::Output,
            10,
            collecting_callback(&results),
        );
        assert!(second.is_none());

        mediator.on_response("s-2", Some(&b64(b"opus-bytes")));
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.as_deref() == Some(b"opus-bytes".as_slice())));
    }

    #[test]
    fn cache_answers_without_a_request() {
        let mediator = AudioMediator::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        mediator
            .play_audio_for_message("s-2", AudioDirection::Output, 0, collecting_callback(&results));
        mediator.on_response("s-2", Some(&b64(b"x")));

        let frame = mediator.play_audio_for_message(
            "s-2",
            AudioDirection::Output,
            100,
            collecting_callback(&results),
        );
        assert!(frame.is_none());
        assert_eq!(results.lock().unwrap().len(), 2);
        assert_eq!(mediator.current_playback().as_deref(), Some("s-2"));
    }

    #[test]
    fn error_response_resolves_empty() {
        let mediator = AudioMediator::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        mediator
            .play_audio_for_message("s-9", AudioDirection::Input, 0, collecting_callback(&results));
        mediator.on_response("s-9", None);
        assert_eq!(results.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn timeout_resolves_empty() {
        let mediator = AudioMediator::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        mediator
            .play_audio_for_message("s-9", AudioDirection::Output, 1_000, collecting_callback(&results));

        mediator.poll(1_000 + AUDIO_REQUEST_TIMEOUT_MS - 1);
        assert!(results.lock().unwrap().is_empty());
        mediator.poll(1_000 + AUDIO_REQUEST_TIMEOUT_MS);
        assert_eq!(results.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn recording_suppresses_playback_and_stops_it() {
        let mediator = AudioMediator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        // Seed the cache and start playing.
        mediator.play_audio_for_message("s-2", AudioDirection::Output, 0, Box::new(|_| {}));
        mediator.on_response("s-2", Some(&b64(b"x")));
        assert!(mediator.current_playback().is_some());

        mediator.start_recording();
        assert!(mediator.current_playback().is_none());

        let calls_clone = Arc::clone(&calls);
        let frame = mediator.play_audio_for_message(
            "s-2",
            AudioDirection::Output,
            0,
            Box::new(move |bytes| {
                assert!(bytes.is_none());
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(frame.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        mediator.stop_recording();
        assert!(!mediator.is_recording());
    }
}
