//! Background pumps wiring runtimes and the registry into the router.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use tiflis_protocol::{ContentType, ErrorCode, Role, ServerMessage};

use crate::registry::runtime::RuntimeEvent;
use crate::registry::{RegistryEvent, SUPERVISOR_SESSION_ID};
use crate::router::OutputDraft;
use crate::state::AppState;
use crate::store::MessageDraft;

/// Drain runtime events into sequence-stamped broadcasts.
///
/// Runs until the event channel closes. A failed sequence allocation or log
/// append force-terminates the affected session with `INTERNAL_ERROR`; its
/// subscribers learn through `session.terminated`.
pub async fn run_runtime_pump(state: AppState, mut rx: mpsc::UnboundedReceiver<RuntimeEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RuntimeEvent::Output {
                session_id,
                content_type,
                content,
                content_blocks,
                streaming_message_id,
                is_complete,
            } => {
                let draft = OutputDraft {
                    session_id: session_id.clone(),
                    role: Role::Assistant,
                    content_type,
                    content,
                    content_blocks,
                    streaming_message_id,
                    is_complete,
                };
                if let Err(e) = state.router.broadcast_output(draft).await {
                    if e.code == ErrorCode::InternalError {
                        warn!("Output for {session_id} failed ({e}), force-terminating");
                        state
                            .registry
                            .terminate_session(
                                &session_id,
                                Some("output failure".to_string()),
                                Some(ErrorCode::InternalError),
                            )
                            .await;
                    } else {
                        debug!("Dropping output for {session_id}: {e}");
                    }
                } else {
                    state.registry.touch(&session_id).await;
                }
            }
            RuntimeEvent::Transcription {
                session_id,
                message_id,
                content,
            } => {
                let draft = MessageDraft {
                    id: message_id.clone(),
                    session_id: session_id.clone(),
                    role: Role::User,
                    content_type: ContentType::Transcription,
                    content: content.clone(),
                    content_blocks: Vec::new(),
                    is_complete: true,
                };
                if let Err(e) = state.store.append(&draft) {
                    warn!("Persisting transcription {message_id} failed: {e}");
                }
                let message = if session_id == SUPERVISOR_SESSION_ID {
                    ServerMessage::SupervisorTranscription {
                        message_id,
                        content,
                    }
                } else {
                    ServerMessage::SessionTranscription {
                        session_id: session_id.clone(),
                        message_id,
                        content,
                    }
                };
                state.router.broadcast_to_session(&session_id, message).await;
            }
            RuntimeEvent::VoiceOutput {
                session_id,
                message_id,
                duration_ms,
            } => {
                let message = if session_id == SUPERVISOR_SESSION_ID {
                    ServerMessage::SupervisorVoiceOutput {
                        message_id,
                        duration_ms,
                    }
                } else {
                    ServerMessage::SessionVoiceOutput {
                        session_id: session_id.clone(),
                        message_id,
                        duration_ms,
                    }
                };
                state.router.broadcast_to_session(&session_id, message).await;
            }
            RuntimeEvent::CliSessionIdDiscovered {
                session_id,
                cli_session_id,
            } => {
                state
                    .registry
                    .set_cli_session_id(&session_id, cli_session_id)
                    .await;
            }
            RuntimeEvent::StatusChanged { session_id, busy } => {
                state.registry.set_busy(&session_id, busy).await;
            }
            RuntimeEvent::ContextCleared { session_id } => {
                state
                    .router
                    .broadcast_to_session(&session_id, ServerMessage::SupervisorContextCleared)
                    .await;
            }
            RuntimeEvent::Exited { session_id, error } => {
                state
                    .registry
                    .terminate_session(&session_id, Some("exited".to_string()), error)
                    .await;
            }
        }
    }
}

/// Fan registry lifecycle events out to devices.
pub async fn run_registry_pump(state: AppState, mut rx: broadcast::Receiver<RegistryEvent>) {
    loop {
        match rx.recv().await {
            Ok(RegistryEvent::SessionCreated(session)) => {
                if let Err(e) = state.store.upsert_session(&session) {
                    warn!("Persisting session {} failed: {e}", session.id);
                }
                state
                    .router
                    .broadcast_all(ServerMessage::SessionCreated { session })
                    .await;
            }
            Ok(RegistryEvent::SessionTerminated {
                session_id,
                reason,
                error,
            }) => {
                state
                    .router
                    .session_terminated(&session_id, reason, error)
                    .await;
            }
            Ok(RegistryEvent::AgentCliSessionIdDiscovered {
                session_id,
                cli_session_id,
            }) => {
                debug!("Session {session_id} discovered CLI context id {cli_session_id}");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Registry pump lagged, {n} events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Periodically drop devices that stopped heartbeating.
pub async fn run_device_sweep(state: AppState) {
    let timeout_ms = state.config.server.device_idle_timeout_secs * 1000;
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        interval.tick().await;
        for device_id in state.devices.sweep_idle(timeout_ms).await {
            state.router.unregister_device(&device_id).await;
        }
    }
}
