//! Sync bootstrap and subscription restoration.
//!
//! After every successful auth the client issues `sync` (full, or
//! lightweight for the watch) and re-subscribes to the union of its
//! locally persisted subscription set and whatever the server reports as
//! restored. Per-session history stays lazy — views request pages with
//! `history.request` as they open.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tiflis_protocol::{
    AgentAlias, ClientMessage, SessionInfo, SessionStatus, StreamingSnapshot, WorkspaceInfo,
};

use crate::observable::Observable;

/// Client-side view of workstation state, fed by `sync.state` and the
/// session lifecycle events.
pub struct SyncEngine {
    /// Live sessions as last reported.
    pub sessions: Observable<Vec<SessionInfo>>,
    /// Workspace tree for the session-creation UI.
    pub workspaces: Observable<Vec<WorkspaceInfo>>,
    /// Advertised agent aliases.
    pub agent_aliases: Observable<Vec<AgentAlias>>,
    /// In-progress streams, for immediate rendering before the next event.
    pub streaming: Observable<Vec<StreamingSnapshot>>,
    hidden_base_types: Mutex<Vec<String>>,
    /// Locally persisted subscriptions; survives auth errors so the next
    /// valid auth restores them.
    subscriptions: Mutex<BTreeSet<String>>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            sessions: Observable::new(Vec::new()),
            workspaces: Observable::new(Vec::new()),
            agent_aliases: Observable::new(Vec::new()),
            streaming: Observable::new(Vec::new()),
            hidden_base_types: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    /// Frames to send after `auth.success`: one `sync`, then a subscribe
    /// for every session in the union of the local set and the server's
    /// `restored_subscriptions`.
    pub fn post_auth_frames(&self, restored: &[String], lightweight: bool) -> Vec<ClientMessage> {
        let union: Vec<String> = {
            let mut local = self.lock_subscriptions();
            for session_id in restored {
                local.insert(session_id.clone());
            }
            local.iter().cloned().collect()
        };
        let mut frames = vec![ClientMessage::Sync { lightweight }];
        frames.extend(
            union
                .into_iter()
                .map(|session_id| ClientMessage::SessionSubscribe { session_id }),
        );
        frames
    }

    /// Record a local subscribe (sent or confirmed).
    pub fn note_subscribed(&self, session_id: &str) {
        self.lock_subscriptions().insert(session_id.to_string());
    }

    /// Record a local unsubscribe.
    pub fn note_unsubscribed(&self, session_id: &str) {
        self.lock_subscriptions().remove(session_id);
    }

    /// Locally persisted subscription set.
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock_subscriptions().iter().cloned().collect()
    }

    /// Apply a `sync.state` snapshot.
    #[allow(clippy::needless_pass_by_value)]
    pub fn apply_sync_state(
        &self,
        sessions: Vec<SessionInfo>,
        server_subscriptions: Vec<String>,
        streaming: Vec<StreamingSnapshot>,
        agent_aliases: Vec<AgentAlias>,
        hidden_base_types: Vec<String>,
        workspaces: Vec<WorkspaceInfo>,
    ) {
        self.sessions.set(sessions);
        self.streaming.set(streaming);
        self.agent_aliases.set(agent_aliases);
        self.workspaces.set(workspaces);
        *self
            .hidden_base_types
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = hidden_base_types;
        let mut local = self.lock_subscriptions();
        for session_id in server_subscriptions {
            local.insert(session_id);
        }
    }

    /// Agent base types the picker should not offer.
    pub fn hidden_base_types(&self) -> Vec<String> {
        self.hidden_base_types
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Track a `session.created` event.
    pub fn on_session_created(&self, session: SessionInfo) {
        self.sessions.update(|sessions| {
            if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
                *existing = session.clone();
            } else {
                sessions.push(session.clone());
            }
        });
    }

    /// Track a `session.terminated` event.
    pub fn on_session_terminated(&self, session_id: &str) {
        self.sessions.update(|sessions| {
            for session in sessions.iter_mut() {
                if session.id == session_id {
                    session.status = SessionStatus::Terminated;
                }
            }
            sessions.retain(|s| s.id != session_id);
        });
        self.note_unsubscribed(session_id);
        self.streaming
            .update(|streams| streams.retain(|s| s.session_id != session_id));
    }

    /// Builder for a lazy history page request.
    pub fn history_request(
        session_id: &str,
        before_sequence: Option<u64>,
        limit: Option<u32>,
    ) -> ClientMessage {
        ClientMessage::HistoryRequest {
            session_id: session_id.to_string(),
            before_sequence,
            limit,
        }
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiflis_protocol::SessionKind;

    fn session(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            kind: SessionKind::Agent,
            status: SessionStatus::Idle,
            working_dir: "/".into(),
            workspace: None,
            project: None,
            worktree: None,
            agent_name: Some("claude".into()),
            created_at: 0,
            last_activity_at: 0,
        }
    }

    #[test]
    fn post_auth_resolves_the_union() {
        let sync = SyncEngine::new();
        sync.note_subscribed("claude-aaaaaaaa");
        sync.note_subscribed("claude-bbbbbbbb");

        let frames = sync.post_auth_frames(
            &["claude-bbbbbbbb".to_string(), "claude-cccccccc".to_string()],
            false,
        );
        assert!(matches!(frames[0], ClientMessage::Sync { lightweight: false }));
        let subscribed: Vec<&str> = frames[1..]
            .iter()
            .map(|f| match f {
                ClientMessage::SessionSubscribe { session_id } => session_id.as_str(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(
            subscribed,
            vec!["claude-aaaaaaaa", "claude-bbbbbbbb", "claude-cccccccc"]
        );
    }

    #[test]
    fn lightweight_sync_for_the_watch() {
        let sync = SyncEngine::new();
        let frames = sync.post_auth_frames(&[], true);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ClientMessage::Sync { lightweight: true }));
    }

    #[test]
    fn subscriptions_survive_auth_failure_locally() {
        let sync = SyncEngine::new();
        sync.note_subscribed("claude-aaaaaaaa");
        // Auth fails; nothing is cleared. The next successful auth still
        // re-subscribes.
        let frames = sync.post_auth_frames(&[], false);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn terminated_sessions_leave_every_view() {
        let sync = SyncEngine::new();
        sync.on_session_created(session("claude-aaaaaaaa"));
        sync.note_subscribed("claude-aaaaaaaa");
        sync.streaming.set(vec![StreamingSnapshot {
            session_id: "claude-aaaaaaaa".into(),
            streaming_message_id: "s-1".into(),
            content_blocks: Vec::new(),
        }]);

        sync.on_session_terminated("claude-aaaaaaaa");
        assert!(sync.sessions.snapshot().is_empty());
        assert!(sync.subscriptions().is_empty());
        assert!(sync.streaming.snapshot().is_empty());
    }

    #[test]
    fn sync_state_replaces_views_and_merges_subscriptions() {
        let sync = SyncEngine::new();
        sync.note_subscribed("claude-local00");
        sync.apply_sync_state(
            vec![session("claude-aaaaaaaa")],
            vec!["claude-server0".to_string()],
            Vec::new(),
            vec![AgentAlias {
                alias: "fast".into(),
                base_type: "claude".into(),
            }],
            vec!["opencode".to_string()],
            Vec::new(),
        );
        assert_eq!(sync.sessions.snapshot().len(), 1);
        assert_eq!(sync.agent_aliases.snapshot()[0].alias, "fast");
        assert_eq!(sync.hidden_base_types(), vec!["opencode"]);
        assert_eq!(
            sync.subscriptions(),
            vec!["claude-local00", "claude-server0"]
        );
    }
}
