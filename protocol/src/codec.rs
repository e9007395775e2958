//! Frame encoding and validation.
//!
//! Both ingress and egress pass through these functions. An unknown `type`,
//! a missing required field, or malformed JSON all decode to an
//! `INVALID_PAYLOAD` error carrying the serde diagnostic; unknown extra
//! fields are silently ignored.

use crate::error::{ErrorCode, ErrorPayload};
use crate::message::{Inbound, Outbound};

/// Decode a client → workstation frame.
pub fn decode_inbound(text: &str) -> Result<Inbound, ErrorPayload> {
    serde_json::from_str(text).map_err(invalid_payload)
}

/// Encode a client → workstation frame.
pub fn encode_inbound(frame: &Inbound) -> Result<String, ErrorPayload> {
    serde_json::to_string(frame)
        .map_err(|e| ErrorPayload::new(ErrorCode::InternalError, format!("encode failed: {e}")))
}

/// Decode a workstation → client frame.
pub fn decode_outbound(text: &str) -> Result<Outbound, ErrorPayload> {
    serde_json::from_str(text).map_err(invalid_payload)
}

/// Encode a workstation → client frame.
pub fn encode_outbound(frame: &Outbound) -> Result<String, ErrorPayload> {
    serde_json::to_string(frame)
        .map_err(|e| ErrorPayload::new(ErrorCode::InternalError, format!("encode failed: {e}")))
}

fn invalid_payload(e: serde_json::Error) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::InvalidPayload, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientMessage, ServerMessage};

    #[test]
    fn unknown_type_is_invalid_payload() {
        let err = decode_inbound(r#"{"type":"session.levitate","session_id":"x"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn missing_required_field_is_invalid_payload() {
        // session.subscribe requires session_id
        let err = decode_inbound(r#"{"type":"session.subscribe"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn malformed_json_is_invalid_payload() {
        let err = decode_inbound("not json at all").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn unknown_optional_fields_are_ignored() {
        let frame = decode_inbound(
            r#"{"type":"session.subscribe","session_id":"claude-abc12345","hint":"fresh"}"#,
        )
        .unwrap();
        assert_eq!(frame.session_id(), Some("claude-abc12345"));
    }

    #[test]
    fn every_client_frame_round_trips() {
        use crate::message::AudioDirection;
        use crate::types::SessionKind;

        let frames = vec![
            ClientMessage::Connect {
                tunnel_id: "t-1".into(),
                auth_key: "K".into(),
                device_id: "D1".into(),
                reconnect: true,
            },
            ClientMessage::Auth {
                auth_key: "K".into(),
                device_id: "D1".into(),
            },
            ClientMessage::Heartbeat { timestamp: 1 },
            ClientMessage::SupervisorCommand {
                message_id: "m-1".into(),
                content: "create a session".into(),
            },
            ClientMessage::SupervisorCancel,
            ClientMessage::SupervisorClearContext,
            ClientMessage::SupervisorCreateSession {
                kind: SessionKind::Agent,
                workspace: Some("ws".into()),
                project: Some("proj".into()),
                worktree: None,
                agent_name: Some("claude".into()),
                cols: None,
                rows: None,
            },
            ClientMessage::SupervisorTerminateSession {
                session_id: "claude-abc12345".into(),
            },
            ClientMessage::SupervisorListSessions,
            ClientMessage::SessionSubscribe {
                session_id: "claude-abc12345".into(),
            },
            ClientMessage::SessionUnsubscribe {
                session_id: "claude-abc12345".into(),
            },
            ClientMessage::SessionExecute {
                session_id: "claude-abc12345".into(),
                message_id: "m-2".into(),
                content: "ls".into(),
            },
            ClientMessage::SessionCancel {
                session_id: "claude-abc12345".into(),
            },
            ClientMessage::SessionInput {
                session_id: "terminal-deadbeef".into(),
                data: "ls\r".into(),
            },
            ClientMessage::SessionResize {
                session_id: "terminal-deadbeef".into(),
                cols: 120,
                rows: 40,
            },
            ClientMessage::SessionReplay {
                session_id: "terminal-deadbeef".into(),
                since_sequence: Some(10),
                since_timestamp: None,
                limit: Some(100),
            },
            ClientMessage::HistoryRequest {
                session_id: "supervisor".into(),
                before_sequence: None,
                limit: Some(20),
            },
            ClientMessage::AudioRequest {
                message_id: "s-2".into(),
                direction: AudioDirection::Output,
            },
            ClientMessage::Sync { lightweight: true },
        ];

        for message in frames {
            let name = message.type_name();
            let encoded = encode_inbound(&Inbound::new(message)).unwrap();
            let decoded = decode_inbound(&encoded).unwrap();
            assert_eq!(decoded.message.type_name(), name, "round trip of {name}");
        }
    }

    #[test]
    fn server_frames_round_trip() {
        let frames = vec![
            ServerMessage::Connected {
                tunnel_id: "t-1".into(),
                protocol_version: crate::PROTOCOL_VERSION.into(),
                restored: false,
            },
            ServerMessage::HeartbeatAck {
                timestamp: 9,
                workstation_uptime_ms: 1000,
            },
            ServerMessage::SupervisorContextCleared,
            ServerMessage::WorkstationOffline,
            ServerMessage::WorkstationOnline,
            ServerMessage::AuthError {
                code: ErrorCode::InvalidAuthKey,
                message: "bad key".into(),
            },
        ];
        for message in frames {
            let name = message.type_name();
            let encoded = encode_outbound(&Outbound::new(message)).unwrap();
            let decoded = decode_outbound(&encoded).unwrap();
            assert_eq!(decoded.message.type_name(), name, "round trip of {name}");
        }
    }

    #[test]
    fn device_id_survives_the_tunnel_hop() {
        // The tunnel rewrites device_id on ingress; the codec must carry it.
        let mut frame = decode_inbound(r#"{"type":"sync","device_id":"forged"}"#).unwrap();
        frame.device_id = Some("D-authenticated".into());
        let text = encode_inbound(&frame).unwrap();
        let reparsed = decode_inbound(&text).unwrap();
        assert_eq!(reparsed.device_id.as_deref(), Some("D-authenticated"));
    }
}
