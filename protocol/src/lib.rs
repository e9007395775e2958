#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! Wire protocol for the tiflis session backbone.
//!
//! Every frame on the wire is a JSON object with a required `"type"` field
//! that selects the payload shape, an optional `"id"` for request
//! correlation, and — on frames that cross the tunnel — a `"device_id"`
//! routing tag. The tunnel injects `device_id` on ingress; the workstation
//! trusts only the injected value and ignores anything a client sets itself.
//!
//! The unions in [`message`] are closed: a frame whose `type` is not a known
//! variant fails decoding with `INVALID_PAYLOAD`. Unknown *fields* inside a
//! known frame are ignored, which is the forward-compatibility contract —
//! newer peers may add optional fields, never new required ones.

pub mod blocks;
pub mod codec;
pub mod error;
pub mod message;
pub mod relay;
pub mod types;

pub use blocks::{ActionButton, BlockKind, ContentBlock, ToolCallStatus};
pub use codec::{decode_inbound, decode_outbound, encode_inbound, encode_outbound};
pub use error::{ErrorCode, ErrorPayload};
pub use message::{AckStatus, AudioDirection, ClientMessage, Inbound, Outbound, ServerMessage};
pub use relay::RelayFrame;
pub use types::{
    AgentAlias, ContentType, MessageRecord, ProjectInfo, Role, SequencedEvent, SessionInfo,
    SessionKind, SessionStatus, StreamingSnapshot, WorkspaceInfo, SUPERVISOR_SESSION_ID,
};

/// Protocol version reported in `connected` and `auth.success`.
pub const PROTOCOL_VERSION: &str = "1.13";

/// Extract the major component of a dotted protocol version string.
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

/// Whether two protocol versions can interoperate.
///
/// Only the major component must match; minor revisions are additive.
pub fn versions_compatible(ours: &str, theirs: &str) -> bool {
    match (major_version(ours), major_version(theirs)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_major_is_compatible() {
        assert!(versions_compatible("1.13", "1.2"));
        assert!(versions_compatible(PROTOCOL_VERSION, "1.0"));
    }

    #[test]
    fn different_major_is_incompatible() {
        assert!(!versions_compatible("1.13", "2.0"));
    }

    #[test]
    fn garbage_version_is_incompatible() {
        assert!(!versions_compatible("1.13", "latest"));
        assert!(!versions_compatible("", "1.13"));
    }
}
