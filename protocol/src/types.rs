//! Shared model types: sessions, messages, and the fan-out event envelope.

use serde::{Deserialize, Serialize};

use crate::blocks::ContentBlock;

/// Reserved id of the singleton supervisor session.
pub const SUPERVISOR_SESSION_ID: &str = "supervisor";

/// What kind of runtime backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Singleton coordinator session — exactly one per workstation.
    Supervisor,
    /// Headless AI-CLI process wrapped as a session.
    Agent,
    /// PTY-backed shell session.
    Terminal,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Agent => "agent",
            Self::Terminal => "terminal",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(Self::Supervisor),
            "agent" => Ok(Self::Agent),
            "terminal" => Ok(Self::Terminal),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

/// Session lifecycle status.
///
/// `Terminated` is absorbing; `Busy` and `Idle` flip while a session is
/// executing or waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Busy,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminated => "terminated",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Session metadata as shipped to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Kind-prefixed id, e.g. `claude-abc12345` or `terminal-0f3e9a21`.
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    /// Resolved agent name (alias or base type), agent sessions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u64,
    /// Epoch milliseconds of the last input or output.
    pub last_activity_at: u64,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// What a message's `content` field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Audio,
    Transcription,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Transcription => "transcription",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "audio" => Ok(Self::Audio),
            "transcription" => Ok(Self::Transcription),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

/// One durable record in a session's message log.
///
/// `id` is stable across devices; for assistant-streamed messages it equals
/// the `streaming_message_id` of the stream that produced it. `sequence` is
/// allocated by the workstation and is strictly increasing within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub sequence: u64,
    pub role: Role,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_output_path: Option<String>,
    pub is_complete: bool,
    /// Epoch milliseconds.
    pub created_at: u64,
}

/// Fan-out envelope for one streamed output frame.
///
/// `sequence` is the client's authority for gap detection;
/// `streaming_message_id` lets every subscribed device converge on the same
/// message record while the stream is in progress. `is_complete` marks the
/// terminal frame, after which the message is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub session_id: String,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_message_id: Option<String>,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
    pub is_complete: bool,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Current in-progress stream for one session, as carried in sync and
/// subscription snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSnapshot {
    pub session_id: String,
    pub streaming_message_id: String,
    pub content_blocks: Vec<ContentBlock>,
}

/// An agent alias visible to clients (e.g. `claude` → a pinned CLI flavor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAlias {
    pub alias: String,
    pub base_type: String,
}

/// One project inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub default_branch: String,
}

/// One workspace in the workstation's workspace tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub name: String,
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
}
