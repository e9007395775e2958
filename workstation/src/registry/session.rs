//! The session model and its status transition rules.

use tiflis_protocol::{SessionInfo, SessionKind, SessionStatus};

use crate::util::now_ms;

/// One live session owned by the registry.
///
/// Status rules: `Terminated` is absorbing, and the `Busy`/`Idle` flip is
/// only legal while the session is alive.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub working_dir: String,
    pub workspace: Option<String>,
    pub project: Option<String>,
    pub worktree: Option<String>,
    /// Resolved agent name (alias or base type), agent sessions only.
    pub agent_name: Option<String>,
    /// Provider-side context id, learned after the agent's first execution.
    /// Enables resume-style continuation in the agent runtime.
    pub cli_session_id: Option<String>,
    /// Terminal geometry, terminal sessions only.
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
    pub last_activity_at: u64,
}

impl Session {
    pub fn new(id: String, kind: SessionKind, working_dir: String) -> Self {
        let now = now_ms();
        Self {
            id,
            kind,
            status: SessionStatus::Active,
            working_dir,
            workspace: None,
            project: None,
            worktree: None,
            agent_name: None,
            cli_session_id: None,
            cols: 0,
            rows: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Apply a status transition. `Terminated` is absorbing: any transition
    /// out of it (including a repeat terminate) is rejected.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), String> {
        if self.status == SessionStatus::Terminated {
            return Err(format!("session {} is terminated", self.id));
        }
        self.status = to;
        Ok(())
    }

    /// Record input/output activity.
    pub fn touch(&mut self) {
        self.last_activity_at = now_ms();
    }

    pub fn is_executing(&self) -> bool {
        self.status == SessionStatus::Busy
    }

    /// Wire-form metadata.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            working_dir: self.working_dir.clone(),
            workspace: self.workspace.clone(),
            project: self.project.clone(),
            worktree: self.worktree.clone(),
            agent_name: self.agent_name.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "claude-abc12345".into(),
            SessionKind::Agent,
            "/work".into(),
        )
    }

    #[test]
    fn busy_idle_flip_while_alive() {
        let mut s = session();
        s.transition(SessionStatus::Busy).unwrap();
        assert!(s.is_executing());
        s.transition(SessionStatus::Idle).unwrap();
        assert!(!s.is_executing());
    }

    #[test]
    fn terminated_is_absorbing() {
        let mut s = session();
        s.transition(SessionStatus::Terminated).unwrap();
        assert!(s.transition(SessionStatus::Idle).is_err());
        assert!(s.transition(SessionStatus::Busy).is_err());
        assert!(s.transition(SessionStatus::Terminated).is_err());
        assert_eq!(s.status, SessionStatus::Terminated);
    }
}
