//! Closed error-code set and the wire error payload.

use serde::{Deserialize, Serialize};

/// Every error code the workstation may put on the wire.
///
/// The set is closed — clients switch on it for recovery policy, so adding a
/// code is a protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidAuthKey,
    SessionNotFound,
    SessionBusy,
    InvalidPayload,
    InternalError,
    WorkspaceNotFound,
    ProjectNotFound,
    SessionLimitReached,
    SessionCreationFailed,
    AgentCommandFailed,
    NotSubscribed,
    TunnelNotConnected,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidAuthKey => "INVALID_AUTH_KEY",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionBusy => "SESSION_BUSY",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::InternalError => "INTERNAL_ERROR",
            Self::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::SessionLimitReached => "SESSION_LIMIT_REACHED",
            Self::SessionCreationFailed => "SESSION_CREATION_FAILED",
            Self::AgentCommandFailed => "AGENT_COMMAND_FAILED",
            Self::NotSubscribed => "NOT_SUBSCRIBED",
            Self::TunnelNotConnected => "TUNNEL_NOT_CONNECTED",
        }
    }

    /// Whether the error is worth retrying at the transport layer.
    ///
    /// Protocol-level and auth errors are deterministic — retrying the same
    /// frame yields the same answer.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::InternalError | Self::TunnelNotConnected)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body carried by `error` and `auth.error` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorPayload {}
