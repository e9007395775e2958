//! Session lifecycle management.
//!
//! [`SessionRegistry`] is the single authority for creating, accessing, and
//! terminating sessions. Creation is dispatched on [`SessionKind`]:
//!
//! - **supervisor** — idempotent singleton; a second create returns the live
//!   one.
//! - **agent** — resolves the requested name through the alias table and
//!   registers `<agent>-<8-hex-nonce>` with the agent runtime.
//! - **terminal** — registers with the terminal runtime using the requested
//!   (or configured default) geometry.
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock`. Reads (metadata, listing) take a
//! read lock; mutations take a write lock. `create` holds the write lock
//! across the limit-check and insert to prevent TOCTOU races.

pub mod runtime;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use tiflis_protocol::{ErrorCode, ErrorPayload, SessionInfo, SessionKind, SessionStatus};

use crate::config::{AgentsConfig, Config, WorkspaceConfig};
use crate::util::nonce8;
use runtime::SessionRuntime;
use session::Session;

pub use tiflis_protocol::SUPERVISOR_SESSION_ID;

/// Lifecycle events other components subscribe to.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    SessionCreated(SessionInfo),
    SessionTerminated {
        session_id: String,
        reason: Option<String>,
        error: Option<ErrorCode>,
    },
    AgentCliSessionIdDiscovered {
        session_id: String,
        cli_session_id: String,
    },
}

/// Parameters for [`SessionRegistry::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionSpec {
    pub workspace: Option<String>,
    pub project: Option<String>,
    pub worktree: Option<String>,
    pub agent_name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Owns the `id → Session` map and the supervisor slot.
///
/// Cloneable — all clones share the same inner state.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    runtime: Arc<dyn SessionRuntime>,
    events: broadcast::Sender<RegistryEvent>,
    agents: AgentsConfig,
    max_sessions: usize,
    default_cols: u16,
    default_rows: u16,
    workspaces_root: String,
    known_workspaces: Vec<WorkspaceConfig>,
}

impl SessionRegistry {
    pub fn new(config: &Config, runtime: Arc<dyn SessionRuntime>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            runtime,
            events,
            agents: config.agents.clone(),
            max_sessions: config.server.max_sessions,
            default_cols: config.server.default_terminal_cols,
            default_rows: config.server.default_terminal_rows,
            workspaces_root: config.server.workspaces_root.clone(),
            known_workspaces: config.workspaces.clone(),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Resolve an agent name through the alias table. `None` picks the
    /// configured default agent.
    pub fn resolve_agent_name(&self, requested: Option<&str>) -> String {
        let name = requested.unwrap_or(&self.agents.default_agent);
        self.agents
            .aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Create a session, dispatched on kind. Idempotent for the supervisor.
    pub async fn create_session(
        &self,
        kind: SessionKind,
        spec: CreateSessionSpec,
    ) -> Result<SessionInfo, ErrorPayload> {
        let mut sessions = self.sessions.write().await;

        if kind == SessionKind::Supervisor {
            if let Some(existing) = sessions.get(SUPERVISOR_SESSION_ID) {
                return Ok(existing.info());
            }
        } else {
            // The supervisor doesn't count against the limit.
            let active = sessions
                .keys()
                .filter(|id| id.as_str() != SUPERVISOR_SESSION_ID)
                .count();
            if active >= self.max_sessions {
                return Err(ErrorPayload::new(
                    ErrorCode::SessionLimitReached,
                    format!("Session limit reached (max {})", self.max_sessions),
                ));
            }
        }

        if let Some(workspace) = &spec.workspace {
            if !self.known_workspaces.is_empty() {
                let Some(known) = self.known_workspaces.iter().find(|w| &w.name == workspace)
                else {
                    return Err(ErrorPayload::new(
                        ErrorCode::WorkspaceNotFound,
                        format!("Unknown workspace: {workspace}"),
                    ));
                };
                if let Some(project) = &spec.project {
                    if !known.projects.iter().any(|p| &p.name == project) {
                        return Err(ErrorPayload::new(
                            ErrorCode::ProjectNotFound,
                            format!("Unknown project: {workspace}/{project}"),
                        ));
                    }
                }
            }
        }

        let mut session = match kind {
            SessionKind::Supervisor => Session::new(
                SUPERVISOR_SESSION_ID.to_string(),
                kind,
                self.workspaces_root.clone(),
            ),
            SessionKind::Agent => {
                let agent_name = self.resolve_agent_name(spec.agent_name.as_deref());
                let id = format!("{agent_name}-{}", nonce8());
                let mut s = Session::new(id, kind, self.working_dir_for(&spec));
                s.agent_name = Some(agent_name);
                s
            }
            SessionKind::Terminal => {
                let id = format!("terminal-{}", nonce8());
                let mut s = Session::new(id, kind, self.working_dir_for(&spec));
                s.cols = spec.cols.unwrap_or(self.default_cols);
                s.rows = spec.rows.unwrap_or(self.default_rows);
                s
            }
        };
        session.workspace = spec.workspace;
        session.project = spec.project;
        session.worktree = spec.worktree;

        if let Err(e) = self.runtime.start(&session) {
            return Err(ErrorPayload::new(
                ErrorCode::SessionCreationFailed,
                format!("Failed to start {} session: {e}", kind.as_str()),
            ));
        }

        let info = session.info();
        sessions.insert(session.id.clone(), session);
        info!(
            "Session {} created ({}), total: {}",
            info.id,
            kind.as_str(),
            sessions.len()
        );
        drop(sessions);

        let _ = self.events.send(RegistryEvent::SessionCreated(info.clone()));
        Ok(info)
    }

    /// Metadata for one session.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(session_id).map(Session::info)
    }

    /// All non-terminated sessions.
    pub async fn list_active(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut items: Vec<SessionInfo> = sessions
            .values()
            .filter(|s| s.status != SessionStatus::Terminated)
            .map(Session::info)
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Active sessions of one kind.
    pub async fn list_by_kind(&self, kind: SessionKind) -> Vec<SessionInfo> {
        let mut items = self.list_active().await;
        items.retain(|s| s.kind == kind);
        items
    }

    pub async fn kind_of(&self, session_id: &str) -> Option<SessionKind> {
        self.sessions.read().await.get(session_id).map(|s| s.kind)
    }

    /// Whether the session is currently executing a command.
    pub async fn is_executing(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(Session::is_executing)
    }

    /// Record activity on a session.
    pub async fn touch(&self, session_id: &str) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.touch();
        }
    }

    /// Flip busy/idle from a runtime status event. Ignored for terminated
    /// sessions.
    pub async fn set_busy(&self, session_id: &str, busy: bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(session_id) {
            let target = if busy {
                SessionStatus::Busy
            } else {
                SessionStatus::Idle
            };
            if let Err(e) = s.transition(target) {
                warn!("Ignoring status change for {session_id}: {e}");
            } else {
                s.touch();
            }
        }
    }

    /// Record a discovered provider-side context id and notify listeners.
    pub async fn set_cli_session_id(&self, session_id: &str, cli_session_id: String) {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(session_id) else {
            return;
        };
        s.cli_session_id = Some(cli_session_id.clone());
        drop(sessions);
        let _ = self.events.send(RegistryEvent::AgentCliSessionIdDiscovered {
            session_id: session_id.to_string(),
            cli_session_id,
        });
    }

    /// Update recorded terminal geometry.
    pub async fn set_terminal_size(&self, session_id: &str, cols: u16, rows: u16) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.cols = cols;
            s.rows = rows;
        }
    }

    /// Run a command against the session's runtime. The session must exist
    /// and not be terminated.
    pub async fn with_runtime<F>(&self, session_id: &str, f: F) -> Result<(), ErrorPayload>
    where
        F: FnOnce(&dyn SessionRuntime) -> Result<(), String>,
    {
        {
            let sessions = self.sessions.read().await;
            let Some(s) = sessions.get(session_id) else {
                return Err(ErrorPayload::new(
                    ErrorCode::SessionNotFound,
                    format!("Session {session_id} not found"),
                ));
            };
            if s.status == SessionStatus::Terminated {
                return Err(ErrorPayload::new(
                    ErrorCode::SessionNotFound,
                    format!("Session {session_id} is terminated"),
                ));
            }
        }
        f(self.runtime.as_ref())
            .map_err(|e| ErrorPayload::new(ErrorCode::AgentCommandFailed, e))
    }

    /// Terminate a session: transition, delegate to the runtime, remove from
    /// the map, notify listeners. Idempotent — terminating an unknown id is
    /// a no-op returning `false`.
    pub async fn terminate_session(
        &self,
        session_id: &str,
        reason: Option<String>,
        error: Option<ErrorCode>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(mut session) = sessions.remove(session_id) else {
            return false;
        };
        let _ = session.transition(SessionStatus::Terminated);
        drop(sessions);

        if let Err(e) = self.runtime.terminate(session_id) {
            warn!("Runtime terminate for {session_id} failed: {e}");
        }
        info!("Session {session_id} terminated");
        let _ = self.events.send(RegistryEvent::SessionTerminated {
            session_id: session_id.to_string(),
            reason,
            error,
        });
        true
    }

    /// Terminate every session, isolating per-session failures.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.terminate_session(&id, Some("shutdown".to_string()), None)
                .await;
        }
    }

    /// Aliases visible to clients, with hidden base types filtered out of
    /// the advertised set.
    pub fn agent_aliases(&self) -> Vec<tiflis_protocol::AgentAlias> {
        let mut aliases: Vec<_> = self
            .agents
            .aliases
            .iter()
            .map(|(alias, base)| tiflis_protocol::AgentAlias {
                alias: alias.clone(),
                base_type: base.clone(),
            })
            .collect();
        aliases.sort_by(|a, b| a.alias.cmp(&b.alias));
        aliases
    }

    pub fn hidden_base_types(&self) -> Vec<String> {
        self.agents.hidden_base_types.clone()
    }

    fn working_dir_for(&self, spec: &CreateSessionSpec) -> String {
        match (&spec.workspace, &spec.project) {
            (Some(ws), Some(p)) => format!("{}/{ws}/{p}", self.workspaces_root),
            (Some(ws), None) => format!("{}/{ws}", self.workspaces_root),
            _ => self.workspaces_root.clone(),
        }
    }
}
