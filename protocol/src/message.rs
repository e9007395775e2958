//! The closed message unions and their envelopes.
//!
//! ## Frame layout
//!
//! | Field       | Direction | Meaning                                         |
//! |-------------|-----------|-------------------------------------------------|
//! | `type`      | both      | Discriminator — selects the payload shape       |
//! | `id`        | both      | Optional request correlation, echoed on replies |
//! | `device_id` | ingress   | Injected by the tunnel; egress routing tag      |
//! | `session_id`| both      | Present at top level on session-scoped frames   |
//!
//! Streaming outputs additionally carry `sequence`, `streaming_message_id`
//! and `is_complete` (see [`crate::types::SequencedEvent`]).

use serde::{Deserialize, Serialize};

use crate::blocks::ContentBlock;
use crate::error::{ErrorCode, ErrorPayload};
use crate::types::{
    AgentAlias, MessageRecord, SequencedEvent, SessionInfo, SessionKind, StreamingSnapshot,
    WorkspaceInfo,
};

/// Which stored audio stream an `audio.request` wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDirection {
    /// Synthesized speech produced for an assistant message.
    Output,
    /// Raw voice the user recorded.
    Input,
}

/// Envelope for client → workstation frames.
///
/// `device_id` must never be set by clients; the tunnel overwrites it with
/// the authenticated identity on ingress, and the workstation only ever
/// reads the injected value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl Inbound {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            id: None,
            device_id: None,
            message,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The session this frame targets, when session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        self.message.session_id()
    }
}

/// Envelope for workstation → client frames. `device_id` is the tunnel
/// routing tag selecting which device receives the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Outbound {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            id: None,
            device_id: None,
            message,
        }
    }

    pub fn for_device(message: ServerMessage, device_id: impl Into<String>) -> Self {
        Self {
            id: None,
            device_id: Some(device_id.into()),
            message,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }
}

/// Every frame a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Tunnel handshake — answered by the relay, not the workstation.
    #[serde(rename = "connect")]
    Connect {
        tunnel_id: String,
        auth_key: String,
        device_id: String,
        #[serde(default)]
        reconnect: bool,
    },

    #[serde(rename = "auth")]
    Auth { auth_key: String, device_id: String },

    /// Correlation id travels in the envelope `id` field and is echoed on
    /// the ack.
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: u64 },

    #[serde(rename = "supervisor.command")]
    SupervisorCommand { message_id: String, content: String },

    #[serde(rename = "supervisor.cancel")]
    SupervisorCancel,

    #[serde(rename = "supervisor.clear_context")]
    SupervisorClearContext,

    #[serde(rename = "supervisor.create_session")]
    SupervisorCreateSession {
        kind: SessionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worktree: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    #[serde(rename = "supervisor.terminate_session")]
    SupervisorTerminateSession { session_id: String },

    #[serde(rename = "supervisor.list_sessions")]
    SupervisorListSessions,

    #[serde(rename = "session.subscribe")]
    SessionSubscribe { session_id: String },

    #[serde(rename = "session.unsubscribe")]
    SessionUnsubscribe { session_id: String },

    #[serde(rename = "session.execute")]
    SessionExecute {
        session_id: String,
        message_id: String,
        content: String,
    },

    #[serde(rename = "session.cancel")]
    SessionCancel { session_id: String },

    /// Raw terminal keystrokes.
    #[serde(rename = "session.input")]
    SessionInput { session_id: String, data: String },

    #[serde(rename = "session.resize")]
    SessionResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    #[serde(rename = "session.replay")]
    SessionReplay {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_timestamp: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    #[serde(rename = "history.request")]
    HistoryRequest {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    #[serde(rename = "audio.request")]
    AudioRequest {
        message_id: String,
        direction: AudioDirection,
    },

    #[serde(rename = "sync")]
    Sync {
        #[serde(default)]
        lightweight: bool,
    },
}

impl ClientMessage {
    /// Top-level session scope of the frame, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SupervisorTerminateSession { session_id }
            | Self::SessionSubscribe { session_id }
            | Self::SessionUnsubscribe { session_id }
            | Self::SessionExecute { session_id, .. }
            | Self::SessionCancel { session_id }
            | Self::SessionInput { session_id, .. }
            | Self::SessionResize { session_id, .. }
            | Self::SessionReplay { session_id, .. }
            | Self::HistoryRequest { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Wire name of the frame, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Auth { .. } => "auth",
            Self::Heartbeat { .. } => "heartbeat",
            Self::SupervisorCommand { .. } => "supervisor.command",
            Self::SupervisorCancel => "supervisor.cancel",
            Self::SupervisorClearContext => "supervisor.clear_context",
            Self::SupervisorCreateSession { .. } => "supervisor.create_session",
            Self::SupervisorTerminateSession { .. } => "supervisor.terminate_session",
            Self::SupervisorListSessions => "supervisor.list_sessions",
            Self::SessionSubscribe { .. } => "session.subscribe",
            Self::SessionUnsubscribe { .. } => "session.unsubscribe",
            Self::SessionExecute { .. } => "session.execute",
            Self::SessionCancel { .. } => "session.cancel",
            Self::SessionInput { .. } => "session.input",
            Self::SessionResize { .. } => "session.resize",
            Self::SessionReplay { .. } => "session.replay",
            Self::HistoryRequest { .. } => "history.request",
            Self::AudioRequest { .. } => "audio.request",
            Self::Sync { .. } => "sync",
        }
    }
}

/// Every frame the workstation (or tunnel) may send to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Tunnel accepted the `connect` handshake.
    #[serde(rename = "connected")]
    Connected {
        tunnel_id: String,
        protocol_version: String,
        #[serde(default)]
        restored: bool,
    },

    #[serde(rename = "auth.success")]
    AuthSuccess {
        device_id: String,
        workstation_name: String,
        workstation_version: String,
        protocol_version: String,
        workspaces_root: String,
        #[serde(default)]
        restored_subscriptions: Vec<String>,
    },

    #[serde(rename = "auth.error")]
    AuthError { code: ErrorCode, message: String },

    #[serde(rename = "heartbeat.ack")]
    HeartbeatAck {
        timestamp: u64,
        workstation_uptime_ms: u64,
    },

    #[serde(rename = "supervisor.output")]
    SupervisorOutput {
        #[serde(flatten)]
        event: SequencedEvent,
    },

    /// A user message another device sent, mirrored to the rest.
    #[serde(rename = "supervisor.user_message")]
    SupervisorUserMessage { message: MessageRecord },

    #[serde(rename = "supervisor.transcription")]
    SupervisorTranscription {
        message_id: String,
        content: String,
    },

    #[serde(rename = "supervisor.voice_output")]
    SupervisorVoiceOutput {
        message_id: String,
        duration_ms: u64,
    },

    #[serde(rename = "supervisor.context_cleared")]
    SupervisorContextCleared,

    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.terminated")]
    SessionTerminated {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },

    /// Subscription snapshot — session state at one consistent instant.
    #[serde(rename = "session.subscribed")]
    SessionSubscribed {
        session_id: String,
        session: SessionInfo,
        is_executing: bool,
        history: Vec<MessageRecord>,
        streaming_message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        current_streaming_blocks: Vec<ContentBlock>,
    },

    #[serde(rename = "session.output")]
    SessionOutput {
        #[serde(flatten)]
        event: SequencedEvent,
    },

    #[serde(rename = "session.user_message")]
    SessionUserMessage {
        session_id: String,
        message: MessageRecord,
    },

    #[serde(rename = "session.transcription")]
    SessionTranscription {
        session_id: String,
        message_id: String,
        content: String,
    },

    #[serde(rename = "session.voice_output")]
    SessionVoiceOutput {
        session_id: String,
        message_id: String,
        duration_ms: u64,
    },

    #[serde(rename = "session.resized")]
    SessionResized {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    #[serde(rename = "session.replay.data")]
    SessionReplayData {
        session_id: String,
        events: Vec<SequencedEvent>,
        has_more: bool,
    },

    #[serde(rename = "session.listed")]
    SessionListed { sessions: Vec<SessionInfo> },

    #[serde(rename = "history.response")]
    HistoryResponse {
        session_id: String,
        history: Vec<MessageRecord>,
        has_more: bool,
        oldest_sequence: Option<u64>,
        newest_sequence: Option<u64>,
        is_executing: bool,
        streaming_message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        current_streaming_blocks: Vec<ContentBlock>,
    },

    #[serde(rename = "audio.response")]
    AudioResponse {
        message_id: String,
        direction: AudioDirection,
        /// Base64 payload; `None` when the blob could not be served.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },

    /// Durable-accept acknowledgement for a client-generated `message_id`.
    #[serde(rename = "message.ack")]
    MessageAck { message_id: String, status: AckStatus },

    #[serde(rename = "sync.state")]
    SyncState {
        sessions: Vec<SessionInfo>,
        subscriptions: Vec<String>,
        /// Bounded recent supervisor window; omitted on lightweight sync.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supervisor_history: Option<Vec<MessageRecord>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        streaming: Vec<StreamingSnapshot>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        agent_aliases: Vec<AgentAlias>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        hidden_base_types: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        workspaces: Vec<WorkspaceInfo>,
    },

    #[serde(rename = "connection.workstation_offline")]
    WorkstationOffline,

    #[serde(rename = "connection.workstation_online")]
    WorkstationOnline,

    #[serde(rename = "error")]
    Error {
        #[serde(flatten)]
        payload: ErrorPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Acknowledgement status for `message.ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
}

impl ServerMessage {
    /// Wire name of the frame, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::AuthSuccess { .. } => "auth.success",
            Self::AuthError { .. } => "auth.error",
            Self::HeartbeatAck { .. } => "heartbeat.ack",
            Self::SupervisorOutput { .. } => "supervisor.output",
            Self::SupervisorUserMessage { .. } => "supervisor.user_message",
            Self::SupervisorTranscription { .. } => "supervisor.transcription",
            Self::SupervisorVoiceOutput { .. } => "supervisor.voice_output",
            Self::SupervisorContextCleared => "supervisor.context_cleared",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionTerminated { .. } => "session.terminated",
            Self::SessionSubscribed { .. } => "session.subscribed",
            Self::SessionOutput { .. } => "session.output",
            Self::SessionUserMessage { .. } => "session.user_message",
            Self::SessionTranscription { .. } => "session.transcription",
            Self::SessionVoiceOutput { .. } => "session.voice_output",
            Self::SessionResized { .. } => "session.resized",
            Self::SessionReplayData { .. } => "session.replay.data",
            Self::SessionListed { .. } => "session.listed",
            Self::HistoryResponse { .. } => "history.response",
            Self::AudioResponse { .. } => "audio.response",
            Self::MessageAck { .. } => "message.ack",
            Self::SyncState { .. } => "sync.state",
            Self::WorkstationOffline => "connection.workstation_offline",
            Self::WorkstationOnline => "connection.workstation_online",
            Self::Error { .. } => "error",
        }
    }

    /// Streamed output event carried by this frame, if it is one.
    pub fn as_output_event(&self) -> Option<&SequencedEvent> {
        match self {
            Self::SupervisorOutput { event } | Self::SessionOutput { event } => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, Role};

    #[test]
    fn inbound_auth_wire_shape() {
        let frame = Inbound::new(ClientMessage::Auth {
            auth_key: "K-test".into(),
            device_id: "D1".into(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "auth");
        assert_eq!(json["auth_key"], "K-test");
        assert_eq!(json["device_id"], "D1");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn session_scoped_frames_expose_session_id() {
        let frame = Inbound::new(ClientMessage::SessionExecute {
            session_id: "claude-abc12345".into(),
            message_id: "m-1".into(),
            content: "ls".into(),
        });
        assert_eq!(frame.session_id(), Some("claude-abc12345"));

        let frame = Inbound::new(ClientMessage::Sync { lightweight: false });
        assert_eq!(frame.session_id(), None);
    }

    #[test]
    fn auth_success_carries_restored_subscriptions() {
        let msg = ServerMessage::AuthSuccess {
            device_id: "D1".into(),
            workstation_name: "devbox".into(),
            workstation_version: "0.3.0".into(),
            protocol_version: crate::PROTOCOL_VERSION.into(),
            workspaces_root: "/home/dev/ws".into(),
            restored_subscriptions: vec!["claude-abc12345".into()],
        };
        let json = serde_json::to_value(Outbound::new(msg)).unwrap();
        assert_eq!(json["type"], "auth.success");
        assert_eq!(json["protocol_version"], "1.13");
        assert_eq!(json["restored_subscriptions"][0], "claude-abc12345");
    }

    #[test]
    fn output_event_flattens_into_frame() {
        let msg = ServerMessage::SessionOutput {
            event: SequencedEvent {
                session_id: "claude-abc12345".into(),
                sequence: 10,
                streaming_message_id: Some("s-1".into()),
                content_type: ContentType::Text,
                content: String::new(),
                content_blocks: vec![ContentBlock::text("b1", "partial")],
                is_complete: false,
                timestamp: 123,
            },
        };
        let json = serde_json::to_value(Outbound::new(msg)).unwrap();
        assert_eq!(json["type"], "session.output");
        assert_eq!(json["session_id"], "claude-abc12345");
        assert_eq!(json["sequence"], 10);
        assert_eq!(json["streaming_message_id"], "s-1");
        assert_eq!(json["is_complete"], false);
    }

    #[test]
    fn user_message_mirror_nests_record() {
        let msg = ServerMessage::SessionUserMessage {
            session_id: "claude-abc12345".into(),
            message: MessageRecord {
                id: "m-7".into(),
                session_id: "claude-abc12345".into(),
                sequence: 4,
                role: Role::User,
                content_type: ContentType::Text,
                content: "run tests".into(),
                content_blocks: Vec::new(),
                audio_input_path: None,
                audio_output_path: None,
                is_complete: true,
                created_at: 1,
            },
        };
        let json = serde_json::to_value(Outbound::new(msg)).unwrap();
        assert_eq!(json["type"], "session.user_message");
        assert_eq!(json["session_id"], "claude-abc12345");
        assert_eq!(json["message"]["id"], "m-7");
        assert_eq!(json["message"]["role"], "user");
    }

    #[test]
    fn heartbeat_correlation_rides_the_envelope() {
        let frame = Inbound::new(ClientMessage::Heartbeat { timestamp: 42 }).with_id("hb-3");
        let json = serde_json::to_string(&frame).unwrap();
        let back: Inbound = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id.as_deref(), Some("hb-3"));
        assert!(matches!(
            back.message,
            ClientMessage::Heartbeat { timestamp: 42 }
        ));
    }

    #[test]
    fn error_frame_flattens_payload() {
        let msg = ServerMessage::Error {
            payload: ErrorPayload::new(ErrorCode::SessionNotFound, "no such session"),
            session_id: Some("terminal-deadbeef".into()),
        };
        let json = serde_json::to_value(Outbound::new(msg)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "SESSION_NOT_FOUND");
        assert_eq!(json["session_id"], "terminal-deadbeef");
    }
}
