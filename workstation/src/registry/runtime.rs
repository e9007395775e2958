//! The seam between the registry and the processes that actually run
//! sessions.
//!
//! Concrete executors (agent CLI wrappers, the PTY layer, the supervisor's
//! LLM loop) live outside this crate and implement [`SessionRuntime`]. They
//! report everything that happens through [`RuntimeEvent`]s on the channel
//! handed to them at construction; the server pumps those events into the
//! fan-out router.
//!
//! [`EchoRuntime`] is the in-process implementation used by the binary when
//! no executor is wired, and by tests: every execute streams back a single
//! completed assistant message echoing the input.

use tokio::sync::mpsc;

use tiflis_protocol::{BlockKind, ContentBlock, ContentType, ErrorCode};

use super::session::Session;
use crate::util::nonce8;

/// Events a runtime reports back to the backbone.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// One streamed output frame. The router assigns the sequence number.
    Output {
        session_id: String,
        content_type: ContentType,
        content: String,
        content_blocks: Vec<ContentBlock>,
        /// Stable id for the in-progress assistant message; `None` for
        /// terminal frames.
        streaming_message_id: Option<String>,
        is_complete: bool,
    },
    /// A voice command was transcribed.
    Transcription {
        session_id: String,
        message_id: String,
        content: String,
    },
    /// Synthesized speech is ready for a message.
    VoiceOutput {
        session_id: String,
        message_id: String,
        duration_ms: u64,
    },
    /// The agent CLI revealed its provider-side context id.
    CliSessionIdDiscovered {
        session_id: String,
        cli_session_id: String,
    },
    /// Execution started or finished.
    StatusChanged { session_id: String, busy: bool },
    /// The supervisor's conversation context was reset.
    ContextCleared { session_id: String },
    /// The runtime process died. A non-`None` error force-terminates the
    /// session with that code.
    Exited {
        session_id: String,
        error: Option<ErrorCode>,
    },
}

/// Opaque session executor.
///
/// Methods enqueue work and return quickly; progress and results arrive as
/// [`RuntimeEvent`]s.
pub trait SessionRuntime: Send + Sync {
    /// Called once when a session is registered.
    fn start(&self, session: &Session) -> Result<(), String>;
    /// Run a user command in the session.
    fn execute(&self, session_id: &str, message_id: &str, content: &str) -> Result<(), String>;
    /// Cancel the in-flight execution, if any.
    fn cancel(&self, session_id: &str) -> Result<(), String>;
    /// Raw terminal input.
    fn input(&self, session_id: &str, data: &str) -> Result<(), String>;
    /// Resize a terminal.
    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), String>;
    /// Reset conversational context (supervisor only).
    fn clear_context(&self, session_id: &str) -> Result<(), String>;
    /// Tear the session down. Must be idempotent.
    fn terminate(&self, session_id: &str) -> Result<(), String>;
}

/// Minimal in-process runtime: echoes executes back as completed assistant
/// messages and terminal input back as raw frames.
pub struct EchoRuntime {
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

impl EchoRuntime {
    pub fn new(events: mpsc::UnboundedSender<RuntimeEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: RuntimeEvent) -> Result<(), String> {
        self.events
            .send(event)
            .map_err(|_| "runtime event channel closed".to_string())
    }
}

impl SessionRuntime for EchoRuntime {
    fn start(&self, _session: &Session) -> Result<(), String> {
        Ok(())
    }

    fn execute(&self, session_id: &str, _message_id: &str, content: &str) -> Result<(), String> {
        let streaming_message_id = format!("s-{}", nonce8());
        self.emit(RuntimeEvent::StatusChanged {
            session_id: session_id.to_string(),
            busy: true,
        })?;
        self.emit(RuntimeEvent::Output {
            session_id: session_id.to_string(),
            content_type: ContentType::Text,
            content: content.to_string(),
            content_blocks: vec![ContentBlock::text("b-1", content)],
            streaming_message_id: Some(streaming_message_id),
            is_complete: true,
        })?;
        self.emit(RuntimeEvent::StatusChanged {
            session_id: session_id.to_string(),
            busy: false,
        })
    }

    fn cancel(&self, session_id: &str) -> Result<(), String> {
        self.emit(RuntimeEvent::Output {
            session_id: session_id.to_string(),
            content_type: ContentType::Text,
            content: String::new(),
            content_blocks: vec![ContentBlock::new("b-cancel", BlockKind::Cancel)],
            streaming_message_id: Some(format!("s-{}", nonce8())),
            is_complete: true,
        })?;
        self.emit(RuntimeEvent::StatusChanged {
            session_id: session_id.to_string(),
            busy: false,
        })
    }

    fn input(&self, session_id: &str, data: &str) -> Result<(), String> {
        self.emit(RuntimeEvent::Output {
            session_id: session_id.to_string(),
            content_type: ContentType::Text,
            content: data.to_string(),
            content_blocks: Vec::new(),
            streaming_message_id: None,
            is_complete: true,
        })
    }

    fn resize(&self, _session_id: &str, _cols: u16, _rows: u16) -> Result<(), String> {
        Ok(())
    }

    fn clear_context(&self, session_id: &str) -> Result<(), String> {
        self.emit(RuntimeEvent::ContextCleared {
            session_id: session_id.to_string(),
        })
    }

    fn terminate(&self, _session_id: &str) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiflis_protocol::SessionKind;

    #[tokio::test]
    async fn execute_emits_busy_output_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = EchoRuntime::new(tx);
        runtime
            .start(&Session::new(
                "claude-abc12345".into(),
                SessionKind::Agent,
                "/".into(),
            ))
            .unwrap();
        runtime.execute("claude-abc12345", "m-1", "hello").unwrap();

        match rx.recv().await.unwrap() {
            RuntimeEvent::StatusChanged { busy, .. } => assert!(busy),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            RuntimeEvent::Output {
                content,
                is_complete,
                streaming_message_id,
                ..
            } => {
                assert_eq!(content, "hello");
                assert!(is_complete);
                assert!(streaming_message_id.unwrap().starts_with("s-"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            RuntimeEvent::StatusChanged { busy, .. } => assert!(!busy),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
