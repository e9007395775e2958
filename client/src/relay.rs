//! Watch relay — the phone side of the peer channel.
//!
//! A paired phone carries a watch's traffic to the backbone transparently:
//! forwarded frames go out under the phone's own identity (the backbone
//! sees one device), every backbone frame the phone acts on is mirrored
//! back as `relay.response`, and connection state changes are posted as
//! `relay.connectionState`. The relay session lives only while both peers
//! stay up; the phone keeps its own backbone connection either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use tiflis_protocol::{codec, Inbound, Outbound, RelayFrame, ServerMessage};

use crate::connection::ConnectionState;

/// Transport to the watch (the platform's local peer channel).
pub trait PeerLink: Send + Sync {
    fn send_to_watch(&self, frame: RelayFrame);
}

/// Phone-side relay state machine.
pub struct WatchRelay {
    link: Arc<dyn PeerLink>,
    active: AtomicBool,
    workstation_online: AtomicBool,
}

impl WatchRelay {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            active: AtomicBool::new(false),
            workstation_online: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Handle a frame from the watch. Returns the backbone frame to send,
    /// if the frame forwards one.
    pub fn on_watch_frame(
        &self,
        frame: RelayFrame,
        connection_state: &ConnectionState,
    ) -> Option<Inbound> {
        match frame {
            RelayFrame::Connect => {
                self.active.store(true, Ordering::SeqCst);
                self.post_state(connection_state, None);
                None
            }
            RelayFrame::Disconnect => {
                self.active.store(false, Ordering::SeqCst);
                None
            }
            RelayFrame::Message { payload } => {
                if !self.is_active() {
                    return None;
                }
                match serde_json::from_value::<Inbound>(payload) {
                    Ok(mut inbound) => {
                        // The watch shares the phone's identity; whatever it
                        // wrote as device_id never reaches the wire.
                        inbound.device_id = None;
                        Some(inbound)
                    }
                    Err(e) => {
                        debug!("Relay: dropping unparseable watch frame: {e}");
                        self.post_state(connection_state, Some(format!("bad frame: {e}")));
                        None
                    }
                }
            }
            RelayFrame::Sync => {
                if !self.is_active() {
                    return None;
                }
                Some(Inbound::new(tiflis_protocol::ClientMessage::Sync {
                    lightweight: true,
                }))
            }
            RelayFrame::Response { .. } | RelayFrame::ConnectionState { .. } => {
                // Phone→watch frames have no business arriving here.
                debug!("Relay: ignoring phone-bound frame from watch");
                None
            }
        }
    }

    /// Mirror one backbone frame to the watch. Also tracks workstation
    /// presence frames so connection-state posts stay truthful.
    pub fn mirror(&self, frame: &Outbound, connection_state: &ConnectionState) {
        match &frame.message {
            ServerMessage::WorkstationOffline => {
                self.workstation_online.store(false, Ordering::SeqCst);
                self.post_state(connection_state, None);
            }
            ServerMessage::WorkstationOnline => {
                self.workstation_online.store(true, Ordering::SeqCst);
                self.post_state(connection_state, None);
            }
            _ => {}
        }
        if !self.is_active() {
            return;
        }
        match codec::encode_outbound(frame).and_then(|text| {
            serde_json::from_str::<serde_json::Value>(&text).map_err(|e| {
                tiflis_protocol::ErrorPayload::new(
                    tiflis_protocol::ErrorCode::InternalError,
                    e.to_string(),
                )
            })
        }) {
            Ok(payload) => self.link.send_to_watch(RelayFrame::Response { payload }),
            Err(e) => debug!("Relay: mirror encode failed: {e}"),
        }
    }

    /// Post the current backbone state to the watch (called on every
    /// connection state change).
    pub fn on_connection_state(&self, state: &ConnectionState) {
        if state.is_sendable() {
            self.workstation_online.store(true, Ordering::SeqCst);
        }
        self.post_state(state, None);
    }

    /// The watch side went away; the relay session is over.
    pub fn on_peer_disconnected(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn post_state(&self, state: &ConnectionState, error: Option<String>) {
        if !self.is_active() {
            return;
        }
        let error = error.or_else(|| match state {
            ConnectionState::Error(msg) => Some(msg.clone()),
            _ => None,
        });
        self.link.send_to_watch(RelayFrame::ConnectionState {
            is_connected: state.is_connected(),
            workstation_online: self.workstation_online.load(Ordering::SeqCst),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tiflis_protocol::ClientMessage;

    #[derive(Default)]
    struct RecordingLink {
        frames: Mutex<Vec<RelayFrame>>,
    }

    impl PeerLink for RecordingLink {
        fn send_to_watch(&self, frame: RelayFrame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn fixture() -> (WatchRelay, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let relay = WatchRelay::new(Arc::clone(&link) as Arc<dyn PeerLink>);
        (relay, link)
    }

    #[test]
    fn connect_posts_connection_state() {
        let (relay, link) = fixture();
        relay.on_watch_frame(RelayFrame::Connect, &ConnectionState::Verified);
        let frames = link.frames.lock().unwrap();
        match &frames[0] {
            RelayFrame::ConnectionState { is_connected, .. } => assert!(is_connected),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn forwarded_frames_shed_any_device_identity() {
        let (relay, _link) = fixture();
        relay.on_watch_frame(RelayFrame::Connect, &ConnectionState::Verified);

        let payload = serde_json::json!({
            "type": "session.subscribe",
            "session_id": "claude-abc12345",
            "device_id": "watch-imposter",
        });
        let forwarded = relay
            .on_watch_frame(
                RelayFrame::Message { payload },
                &ConnectionState::Verified,
            )
            .unwrap();
        assert!(forwarded.device_id.is_none());
        assert!(matches!(
            forwarded.message,
            ClientMessage::SessionSubscribe { .. }
        ));
    }

    #[test]
    fn inactive_relay_forwards_nothing() {
        let (relay, link) = fixture();
        let payload = serde_json::json!({"type": "sync"});
        assert!(relay
            .on_watch_frame(RelayFrame::Message { payload }, &ConnectionState::Verified)
            .is_none());
        assert!(relay
            .on_watch_frame(RelayFrame::Sync, &ConnectionState::Verified)
            .is_none());
        assert!(link.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn mirror_only_while_active() {
        let (relay, link) = fixture();
        let frame = Outbound::new(ServerMessage::SupervisorContextCleared);

        relay.mirror(&frame, &ConnectionState::Verified);
        assert!(link.frames.lock().unwrap().is_empty());

        relay.on_watch_frame(RelayFrame::Connect, &ConnectionState::Verified);
        relay.mirror(&frame, &ConnectionState::Verified);
        let frames = link.frames.lock().unwrap();
        match frames.last().unwrap() {
            RelayFrame::Response { payload } => {
                assert_eq!(payload["type"], "supervisor.context_cleared");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn workstation_presence_reaches_the_watch() {
        let (relay, link) = fixture();
        relay.on_watch_frame(RelayFrame::Connect, &ConnectionState::Verified);
        relay.mirror(
            &Outbound::new(ServerMessage::WorkstationOnline),
            &ConnectionState::Verified,
        );
        let frames = link.frames.lock().unwrap();
        let state_posts: Vec<&RelayFrame> = frames
            .iter()
            .filter(|f| matches!(f, RelayFrame::ConnectionState { .. }))
            .collect();
        match state_posts.last().unwrap() {
            RelayFrame::ConnectionState {
                workstation_online, ..
            } => assert!(workstation_online),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn either_peer_disconnecting_ends_the_session() {
        let (relay, _link) = fixture();
        relay.on_watch_frame(RelayFrame::Connect, &ConnectionState::Verified);
        assert!(relay.is_active());
        relay.on_watch_frame(RelayFrame::Disconnect, &ConnectionState::Verified);
        assert!(!relay.is_active());

        relay.on_watch_frame(RelayFrame::Connect, &ConnectionState::Verified);
        relay.on_peer_disconnected();
        assert!(!relay.is_active());
    }
}
