//! Protocol dispatch for device frames.
//!
//! Both transports (direct LAN WebSocket and the tunnel) decode incoming
//! text into [`Inbound`] envelopes and pass them here together with the
//! authenticated device id. Every reply and broadcast flows through the
//! router's per-device queues — handlers never touch a socket.
//!
//! | Frame                           | Response(s)                                  |
//! |---------------------------------|----------------------------------------------|
//! | `auth`                          | `auth.success` or `auth.error`               |
//! | `heartbeat`                     | `heartbeat.ack`                              |
//! | `supervisor.command`            | `message.ack` (+ mirrored `supervisor.user_message`) |
//! | `supervisor.cancel` / `clear_context` | (events via runtime)                  |
//! | `supervisor.create_session`     | `session.created` (+ broadcast)              |
//! | `supervisor.terminate_session`  | `session.terminated` (+ to subscribers)      |
//! | `supervisor.list_sessions`      | `session.listed`                             |
//! | `session.subscribe`             | `session.subscribed` snapshot                |
//! | `session.unsubscribe`           | (none)                                       |
//! | `session.execute`               | `message.ack` or `error`                     |
//! | `session.input` / `resize`      | (output events) / `session.resized`          |
//! | `session.replay`                | `session.replay.data`                        |
//! | `history.request`               | `history.response`                           |
//! | `audio.request`                 | `audio.response`                             |
//! | `sync`                          | `sync.state`                                 |

pub mod devices;
pub mod local;
pub mod tunnel;

use tracing::{debug, warn};

use tiflis_protocol::{
    AckStatus, AudioDirection, ClientMessage, ContentType, ErrorCode, ErrorPayload, Inbound,
    Outbound, Role, ServerMessage, SessionKind, PROTOCOL_VERSION,
};

use crate::registry::{CreateSessionSpec, SUPERVISOR_SESSION_ID};
use crate::state::AppState;
use crate::store::MessageDraft;

/// Handle one decoded frame from an authenticated transport.
///
/// `device_id` is the tunnel-injected (or locally verified) identity — any
/// `device_id` the client put inside the envelope is ignored.
pub async fn handle_frame(state: &AppState, device_id: &str, frame: Inbound) {
    let request_id = frame.id.clone();
    match frame.message {
        ClientMessage::Connect { .. } => {
            // Tunnel handshake frames are consumed by the relay; one leaking
            // through is harmless.
            debug!("Ignoring connect frame from {device_id}");
        }
        ClientMessage::Auth { auth_key, .. } => {
            handle_auth(state, device_id, &auth_key, request_id).await;
        }
        ClientMessage::Heartbeat { timestamp } => {
            state.devices.touch(device_id).await;
            reply(
                state,
                device_id,
                request_id,
                ServerMessage::HeartbeatAck {
                    timestamp,
                    workstation_uptime_ms: state.uptime_ms(),
                },
            )
            .await;
        }
        message => {
            if !state.devices.is_authenticated(device_id).await {
                reply_error(
                    state,
                    device_id,
                    request_id,
                    ErrorPayload::new(ErrorCode::InvalidAuthKey, "Not authenticated"),
                    None,
                )
                .await;
                return;
            }
            handle_authenticated(state, device_id, request_id, message).await;
        }
    }
}

async fn handle_authenticated(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::SupervisorCommand {
            message_id,
            content,
        } => {
            ensure_supervisor(state).await;
            execute_command(
                state,
                device_id,
                request_id,
                SUPERVISOR_SESSION_ID,
                &message_id,
                &content,
            )
            .await;
        }
        ClientMessage::SupervisorCancel => {
            run_runtime_op(state, device_id, request_id, SUPERVISOR_SESSION_ID, |rt| {
                rt.cancel(SUPERVISOR_SESSION_ID)
            })
            .await;
        }
        ClientMessage::SupervisorClearContext => {
            ensure_supervisor(state).await;
            run_runtime_op(state, device_id, request_id, SUPERVISOR_SESSION_ID, |rt| {
                rt.clear_context(SUPERVISOR_SESSION_ID)
            })
            .await;
        }
        ClientMessage::SupervisorCreateSession {
            kind,
            workspace,
            project,
            worktree,
            agent_name,
            cols,
            rows,
        } => {
            let spec = CreateSessionSpec {
                workspace,
                project,
                worktree,
                agent_name,
                cols,
                rows,
            };
            match state.registry.create_session(kind, spec).await {
                Ok(session) => {
                    if let Err(e) = state.store.upsert_session(&session) {
                        warn!("Persisting session {} failed: {e}", session.id);
                    }
                    reply(
                        state,
                        device_id,
                        request_id,
                        ServerMessage::SessionCreated { session },
                    )
                    .await;
                }
                Err(payload) => {
                    reply_error(state, device_id, request_id, payload, None).await;
                }
            }
        }
        ClientMessage::SupervisorTerminateSession { session_id } => {
            state
                .registry
                .terminate_session(&session_id, Some("user request".to_string()), None)
                .await;
            // Idempotent: confirm even if the session was already gone.
            reply(
                state,
                device_id,
                request_id,
                ServerMessage::SessionTerminated {
                    session_id,
                    reason: Some("user request".to_string()),
                    error: None,
                },
            )
            .await;
        }
        ClientMessage::SupervisorListSessions => {
            let sessions = state.registry.list_active().await;
            reply(
                state,
                device_id,
                request_id,
                ServerMessage::SessionListed { sessions },
            )
            .await;
        }
        ClientMessage::SessionSubscribe { session_id } => {
            match state.router.subscribe(device_id, &session_id).await {
                Ok(snapshot) => reply(state, device_id, request_id, snapshot).await,
                Err(payload) => {
                    reply_error(state, device_id, request_id, payload, Some(&session_id)).await;
                }
            }
        }
        ClientMessage::SessionUnsubscribe { session_id } => {
            state.router.unsubscribe(device_id, &session_id).await;
        }
        ClientMessage::SessionExecute {
            session_id,
            message_id,
            content,
        } => {
            execute_command(state, device_id, request_id, &session_id, &message_id, &content)
                .await;
        }
        ClientMessage::SessionCancel { session_id } => {
            let sid = session_id.clone();
            run_runtime_op(state, device_id, request_id, &session_id, move |rt| {
                rt.cancel(&sid)
            })
            .await;
        }
        ClientMessage::SessionInput { session_id, data } => {
            if state.registry.kind_of(&session_id).await != Some(SessionKind::Terminal) {
                reply_error(
                    state,
                    device_id,
                    request_id,
                    ErrorPayload::new(
                        ErrorCode::InvalidPayload,
                        "session.input targets terminal sessions",
                    ),
                    Some(&session_id),
                )
                .await;
                return;
            }
            state.registry.touch(&session_id).await;
            let sid = session_id.clone();
            run_runtime_op(state, device_id, request_id, &session_id, move |rt| {
                rt.input(&sid, &data)
            })
            .await;
        }
        ClientMessage::SessionResize {
            session_id,
            cols,
            rows,
        } => {
            handle_resize(state, device_id, request_id, &session_id, cols, rows).await;
        }
        ClientMessage::SessionReplay {
            session_id,
            since_sequence,
            since_timestamp,
            limit,
        } => {
            if !state
                .router
                .subscribers_of(&session_id)
                .await
                .iter()
                .any(|d| d.as_str() == device_id)
            {
                reply_error(
                    state,
                    device_id,
                    request_id,
                    ErrorPayload::new(
                        ErrorCode::NotSubscribed,
                        format!("Not subscribed to {session_id}"),
                    ),
                    Some(&session_id),
                )
                .await;
                return;
            }
            match state
                .router
                .replay(
                    &session_id,
                    since_sequence,
                    since_timestamp,
                    limit.unwrap_or(crate::store::log::REPLAY_LIMIT_MAX),
                )
                .await
            {
                Ok((events, has_more)) => {
                    reply(
                        state,
                        device_id,
                        request_id,
                        ServerMessage::SessionReplayData {
                            session_id,
                            events,
                            has_more,
                        },
                    )
                    .await;
                }
                Err(payload) => {
                    reply_error(state, device_id, request_id, payload, Some(&session_id)).await;
                }
            }
        }
        ClientMessage::HistoryRequest {
            session_id,
            before_sequence,
            limit,
        } => {
            match state.router.history(&session_id, before_sequence, limit).await {
                Ok(response) => reply(state, device_id, request_id, response).await,
                Err(payload) => {
                    reply_error(state, device_id, request_id, payload, Some(&session_id)).await;
                }
            }
        }
        ClientMessage::AudioRequest {
            message_id,
            direction,
        } => {
            handle_audio_request(state, device_id, request_id, &message_id, direction).await;
        }
        ClientMessage::Sync { lightweight } => {
            let sync = state.router.sync_state(device_id, lightweight).await;
            reply(state, device_id, request_id, sync).await;
        }
        ClientMessage::Connect { .. }
        | ClientMessage::Auth { .. }
        | ClientMessage::Heartbeat { .. } => {
            // Already handled in handle_frame.
        }
    }
}

async fn handle_auth(
    state: &AppState,
    device_id: &str,
    auth_key: &str,
    request_id: Option<String>,
) {
    if crate::auth::verify_key(state.config.auth.auth_key.as_bytes(), auth_key.as_bytes()) {
        state.devices.set_authenticated(device_id, true).await;
        let restored = state.router.restore_subscriptions(device_id).await;
        debug!(
            "Device {device_id} authenticated ({} restored subscriptions)",
            restored.len()
        );
        reply(
            state,
            device_id,
            request_id,
            ServerMessage::AuthSuccess {
                device_id: device_id.to_string(),
                workstation_name: state.config.server.name.clone(),
                workstation_version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                workspaces_root: state.config.server.workspaces_root.clone(),
                restored_subscriptions: restored,
            },
        )
        .await;
    } else {
        warn!("Device {device_id} presented an invalid auth key");
        state.devices.set_authenticated(device_id, false).await;
        reply(
            state,
            device_id,
            request_id,
            ServerMessage::AuthError {
                code: ErrorCode::InvalidAuthKey,
                message: "Invalid auth key".to_string(),
            },
        )
        .await;
    }
}

/// Durably record a user command, ack it, mirror it, and hand it to the
/// session's runtime.
async fn execute_command(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    session_id: &str,
    message_id: &str,
    content: &str,
) {
    let Some(kind) = state.registry.kind_of(session_id).await else {
        reply_error(
            state,
            device_id,
            request_id,
            ErrorPayload::new(
                ErrorCode::SessionNotFound,
                format!("Session {session_id} not found"),
            ),
            Some(session_id),
        )
        .await;
        return;
    };

    if state.registry.is_executing(session_id).await {
        reply_error(
            state,
            device_id,
            request_id,
            ErrorPayload::new(
                ErrorCode::SessionBusy,
                format!("Session {session_id} is executing"),
            ),
            Some(session_id),
        )
        .await;
        return;
    }

    // Terminal frames are not durable; everything else lands in the log
    // before the ack goes out.
    if kind != SessionKind::Terminal {
        let draft = MessageDraft {
            id: message_id.to_string(),
            session_id: session_id.to_string(),
            role: Role::User,
            content_type: ContentType::Text,
            content: content.to_string(),
            content_blocks: Vec::new(),
            is_complete: true,
        };
        match state.store.append(&draft) {
            Ok(record) => {
                state.router.broadcast_user_message(record, device_id).await;
            }
            Err(e) => {
                reply_error(
                    state,
                    device_id,
                    request_id,
                    ErrorPayload::new(ErrorCode::InternalError, e.to_string()),
                    Some(session_id),
                )
                .await;
                return;
            }
        }
    }

    state.registry.touch(session_id).await;
    reply(
        state,
        device_id,
        request_id.clone(),
        ServerMessage::MessageAck {
            message_id: message_id.to_string(),
            status: AckStatus::Received,
        },
    )
    .await;

    let sid = session_id.to_string();
    let mid = message_id.to_string();
    let cmd = content.to_string();
    let result = state
        .registry
        .with_runtime(session_id, move |rt| rt.execute(&sid, &mid, &cmd))
        .await;
    if let Err(payload) = result {
        reply_error(state, device_id, request_id, payload, Some(session_id)).await;
    }
}

async fn handle_resize(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    session_id: &str,
    cols: u16,
    rows: u16,
) {
    if state.registry.kind_of(session_id).await != Some(SessionKind::Terminal) {
        reply_error(
            state,
            device_id,
            request_id,
            ErrorPayload::new(
                ErrorCode::InvalidPayload,
                "session.resize targets terminal sessions",
            ),
            Some(session_id),
        )
        .await;
        return;
    }
    let sid = session_id.to_string();
    let result = state
        .registry
        .with_runtime(session_id, move |rt| rt.resize(&sid, cols, rows))
        .await;
    match result {
        Ok(()) => {
            state.registry.set_terminal_size(session_id, cols, rows).await;
            state
                .router
                .broadcast_to_session(
                    session_id,
                    ServerMessage::SessionResized {
                        session_id: session_id.to_string(),
                        cols,
                        rows,
                    },
                )
                .await;
        }
        Err(payload) => {
            reply_error(state, device_id, request_id, payload, Some(session_id)).await;
        }
    }
}

async fn handle_audio_request(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    message_id: &str,
    direction: AudioDirection,
) {
    let path = match state.store.get_message(message_id) {
        Ok(Some(record)) => match direction {
            AudioDirection::Input => record.audio_input_path,
            AudioDirection::Output => record.audio_output_path,
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Audio lookup for {message_id} failed: {e}");
            None
        }
    };
    let data = match path {
        Some(p) => state.audio.read_base64(&p).await,
        None => None,
    };
    reply(
        state,
        device_id,
        request_id,
        ServerMessage::AudioResponse {
            message_id: message_id.to_string(),
            direction,
            data,
        },
    )
    .await;
}

async fn run_runtime_op<F>(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    session_id: &str,
    op: F,
) where
    F: FnOnce(&dyn crate::registry::runtime::SessionRuntime) -> Result<(), String>,
{
    if let Err(payload) = state.registry.with_runtime(session_id, op).await {
        reply_error(state, device_id, request_id, payload, Some(session_id)).await;
    }
}

async fn ensure_supervisor(state: &AppState) {
    match state
        .registry
        .create_session(SessionKind::Supervisor, CreateSessionSpec::default())
        .await
    {
        Ok(info) => {
            if let Err(e) = state.store.upsert_session(&info) {
                warn!("Persisting supervisor session failed: {e}");
            }
        }
        Err(e) => warn!("Supervisor creation failed: {e}"),
    }
}

async fn reply(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    message: ServerMessage,
) {
    state
        .router
        .send_to_device(device_id, Outbound::new(message).with_id(request_id))
        .await;
}

async fn reply_error(
    state: &AppState,
    device_id: &str,
    request_id: Option<String>,
    payload: ErrorPayload,
    session_id: Option<&str>,
) {
    reply(
        state,
        device_id,
        request_id,
        ServerMessage::Error {
            payload,
            session_id: session_id.map(ToString::to_string),
        },
    )
    .await;
}
