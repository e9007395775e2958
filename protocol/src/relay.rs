//! Peer-relay frames for the watch ↔ phone local channel.
//!
//! A paired phone forwards a watch's traffic onto the backbone as its own:
//! the backbone sees one device and the watch shares the phone's identity.
//! Payloads are carried opaquely — the phone never interprets them.

use serde::{Deserialize, Serialize};

/// Frames exchanged over the local peer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayFrame {
    /// Watch asks the phone to start relaying.
    #[serde(rename = "relay.connect")]
    Connect,

    /// Either peer ends the relay session.
    #[serde(rename = "relay.disconnect")]
    Disconnect,

    /// Watch → phone: forward this client frame to the backbone verbatim.
    #[serde(rename = "relay.message")]
    Message { payload: serde_json::Value },

    /// Watch asks for a lightweight state refresh.
    #[serde(rename = "relay.sync")]
    Sync,

    /// Phone → watch: a backbone frame the phone acted on, mirrored.
    #[serde(rename = "relay.response")]
    Response { payload: serde_json::Value },

    /// Phone → watch: posted on every backbone state change.
    #[serde(rename = "relay.connectionState")]
    ConnectionState {
        #[serde(rename = "isConnected")]
        is_connected: bool,
        #[serde(rename = "workstationOnline")]
        workstation_online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RelayFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connect => "relay.connect",
            Self::Disconnect => "relay.disconnect",
            Self::Message { .. } => "relay.message",
            Self::Sync => "relay.sync",
            Self::Response { .. } => "relay.response",
            Self::ConnectionState { .. } => "relay.connectionState",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_uses_camel_case_fields() {
        let frame = RelayFrame::ConnectionState {
            is_connected: true,
            workstation_online: false,
            error: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "relay.connectionState");
        assert_eq!(json["isConnected"], true);
        assert_eq!(json["workstationOnline"], false);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn message_payload_is_opaque() {
        let inner = serde_json::json!({"type": "session.subscribe", "session_id": "x"});
        let frame = RelayFrame::Message {
            payload: inner.clone(),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: RelayFrame = serde_json::from_str(&text).unwrap();
        match back {
            RelayFrame::Message { payload } => assert_eq!(payload, inner),
            other => panic!("wrong frame: {other:?}"),
        }
    }
}
