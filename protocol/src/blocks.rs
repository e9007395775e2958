//! Structured content blocks inside a message.
//!
//! Blocks are ordered; identity within a message is the block `id`. While a
//! message streams, the workstation resends the full block list on every
//! frame and the server-provided order is authoritative.

use serde::{Deserialize, Serialize};

/// One element of a message's `content_blocks` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: String,
    #[serde(flatten)]
    pub kind: BlockKind,
}

impl ContentBlock {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Convenience constructor for the most common block.
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, BlockKind::Text { text: text.into() })
    }
}

/// Lifecycle of a tool call block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// A tappable action offered by an `action_buttons` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    /// Opaque action token sent back verbatim when tapped.
    pub action: String,
}

/// Block payload, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Text {
        text: String,
    },
    Code {
        language: String,
        content: String,
    },
    ToolCall {
        name: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        status: ToolCallStatus,
    },
    Thinking {
        text: String,
    },
    Status {
        text: String,
    },
    Error {
        message: String,
    },
    Cancel,
    /// Voice the user spoke; audio bytes are fetched on demand by
    /// `message_id`.
    VoiceInput {
        message_id: String,
        duration_ms: u64,
    },
    /// Synthesized speech for an assistant message.
    VoiceOutput {
        message_id: String,
        duration_ms: u64,
    },
    ActionButtons {
        buttons: Vec<ActionButton>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_block_wire_shape() {
        let block = ContentBlock::text("b1", "hi");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["id"], "b1");
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn tool_call_round_trips() {
        let block = ContentBlock::new(
            "b2",
            BlockKind::ToolCall {
                name: "bash".into(),
                input: serde_json::json!({"command": "ls"}),
                output: Some("README.md\n".into()),
                status: ToolCallStatus::Success,
            },
        );
        let json = serde_json::to_string(&block).unwrap();
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        match back.kind {
            BlockKind::ToolCall { name, status, .. } => {
                assert_eq!(name, "bash");
                assert_eq!(status, ToolCallStatus::Success);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn voice_blocks_carry_message_id() {
        let json = r#"{"id":"b3","type":"voice_output","message_id":"s-9","duration_ms":2140}"#;
        let block: ContentBlock = serde_json::from_str(json).unwrap();
        match block.kind {
            BlockKind::VoiceOutput {
                message_id,
                duration_ms,
            } => {
                assert_eq!(message_id, "s-9");
                assert_eq!(duration_ms, 2140);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn cancel_block_has_no_payload() {
        let block = ContentBlock::new("b4", BlockKind::Cancel);
        let json = serde_json::to_string(&block).unwrap();
        assert_eq!(json, r#"{"id":"b4","type":"cancel"}"#);
    }
}
