//! The application root.
//!
//! One [`ClientRoot`] owns every client-side component — connection,
//! sender, store, reconciler, audio mediator, sync engine, optional watch
//! relay — and wires the frame/state flow between them. Shells construct
//! it once and pass references down; nothing in the crate is process-wide.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use tiflis_protocol::{ClientMessage, ContentType, Inbound, MessageRecord, Outbound, Role,
    ServerMessage};

use crate::audio::AudioMediator;
use crate::config::ClientConfig;
use crate::connection::{CommandTransport, Connection, ConnectionState, FrameHandler};
use crate::reconciler::{ReplayRequester, StreamReconciler};
use crate::relay::WatchRelay;
use crate::sender::{CommandConfig, CommandSender, SendOutcome};
use crate::store::{now_ms, ClientStore};
use crate::sync::SyncEngine;

/// Sends gap-recovery replays through the command pipeline.
struct SenderReplayRequester {
    sender: Arc<CommandSender<Connection>>,
}

impl ReplayRequester for SenderReplayRequester {
    fn request_replay(&self, session_id: &str, since_sequence: u64, limit: u32) {
        let sender = Arc::clone(&self.sender);
        let message = ClientMessage::SessionReplay {
            session_id: session_id.to_string(),
            since_sequence: Some(since_sequence),
            since_timestamp: None,
            limit: Some(limit),
        };
        tokio::spawn(async move {
            let _ = sender.send(CommandConfig::new(message)).await;
        });
    }
}

/// Owner of the whole client pipeline.
pub struct ClientRoot {
    pub connection: Connection,
    pub sender: Arc<CommandSender<Connection>>,
    pub store: Arc<ClientStore>,
    pub reconciler: Arc<StreamReconciler>,
    pub audio: Arc<AudioMediator>,
    pub sync: Arc<SyncEngine>,
    relay: Mutex<Option<Arc<WatchRelay>>>,
}

impl ClientRoot {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let connection = Connection::new(config);
        let sender = Arc::new(CommandSender::new(Arc::new(connection.clone())));
        let store = Arc::new(ClientStore::new());
        let reconciler = Arc::new(StreamReconciler::new(
            Arc::clone(&store),
            Arc::new(SenderReplayRequester {
                sender: Arc::clone(&sender),
            }) as Arc<dyn ReplayRequester>,
        ));
        let root = Arc::new(Self {
            connection: connection.clone(),
            sender,
            store,
            reconciler,
            audio: Arc::new(AudioMediator::new()),
            sync: Arc::new(SyncEngine::new()),
            relay: Mutex::new(None),
        });
        connection.set_handler(Arc::clone(&root) as Arc<dyn FrameHandler>);
        root
    }

    /// Open the connection and start the timeout timers.
    pub fn connect(self: &Arc<Self>) {
        self.connection.connect();
        let root = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                let now = now_ms();
                let failed = root.reconciler.poll(now);
                for message_id in failed {
                    debug!("Message {message_id} unacked past deadline, marked failed");
                }
                root.audio.poll(now);
            }
        });
    }

    /// Tear everything down (user-initiated).
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Attach a watch relay.
    pub fn set_relay(&self, relay: Arc<WatchRelay>) {
        *lock(&self.relay) = Some(relay);
    }

    fn relay(&self) -> Option<Arc<WatchRelay>> {
        lock(&self.relay).clone()
    }

    // -------------------------------------------------------------------
    // Command surface used by the UI shells
    // -------------------------------------------------------------------

    /// Send a command into a session, tracking it for `message.ack`.
    /// Returns the client-generated message id.
    pub async fn execute(&self, session_id: &str, content: &str) -> (String, SendOutcome) {
        let message_id = uuid::Uuid::new_v4().simple().to_string();
        let record = MessageRecord {
            id: message_id.clone(),
            session_id: session_id.to_string(),
            sequence: 0,
            role: Role::User,
            content_type: ContentType::Text,
            content: content.to_string(),
            content_blocks: Vec::new(),
            audio_input_path: None,
            audio_output_path: None,
            is_complete: true,
            created_at: now_ms(),
        };
        self.reconciler.register_sent(record, now_ms());

        let message = if session_id == tiflis_protocol::SUPERVISOR_SESSION_ID {
            ClientMessage::SupervisorCommand {
                message_id: message_id.clone(),
                content: content.to_string(),
            }
        } else {
            ClientMessage::SessionExecute {
                session_id: session_id.to_string(),
                message_id: message_id.clone(),
                content: content.to_string(),
            }
        };
        let outcome = self.sender.send(CommandConfig::new(message)).await;
        (message_id, outcome)
    }

    /// Subscribe to a session (and remember it locally for restores).
    pub async fn subscribe(&self, session_id: &str) -> SendOutcome {
        self.sync.note_subscribed(session_id);
        self.sender
            .send(CommandConfig::new(ClientMessage::SessionSubscribe {
                session_id: session_id.to_string(),
            }))
            .await
    }

    pub async fn unsubscribe(&self, session_id: &str) -> SendOutcome {
        self.sync.note_unsubscribed(session_id);
        self.sender
            .send(CommandConfig::new(ClientMessage::SessionUnsubscribe {
                session_id: session_id.to_string(),
            }))
            .await
    }

    /// Request one lazy history page for a session view.
    pub async fn load_history(
        &self,
        session_id: &str,
        before_sequence: Option<u64>,
        limit: Option<u32>,
    ) -> SendOutcome {
        self.sender
            .send(CommandConfig::new(SyncEngine::history_request(
                session_id,
                before_sequence,
                limit,
            )))
            .await
    }

    /// Play a message's stored audio, fetching it if needed.
    pub async fn play_audio_for_message(
        &self,
        message_id: &str,
        direction: tiflis_protocol::AudioDirection,
        callback: crate::audio::AudioCallback,
    ) {
        if let Some(request) =
            self.audio
                .play_audio_for_message(message_id, direction, now_ms(), callback)
        {
            let _ = self.sender.send(CommandConfig::new(request)).await;
        }
    }
}

impl FrameHandler for ClientRoot {
    fn on_frame(&self, frame: Outbound) {
        if let Some(relay) = self.relay() {
            relay.mirror(&frame, &self.connection.state());
        }

        match frame.message {
            ServerMessage::AuthSuccess {
                restored_subscriptions,
                ..
            } => {
                let frames = self.sync.post_auth_frames(&restored_subscriptions, false);
                let sender = Arc::clone(&self.sender);
                tokio::spawn(async move {
                    for message in frames {
                        let _ = sender.send(CommandConfig::new(message)).await;
                    }
                });
            }
            ServerMessage::SyncState {
                sessions,
                subscriptions,
                supervisor_history,
                streaming,
                agent_aliases,
                hidden_base_types,
                workspaces,
            } => {
                self.sync.apply_sync_state(
                    sessions,
                    subscriptions,
                    streaming,
                    agent_aliases,
                    hidden_base_types,
                    workspaces,
                );
                if let Some(history) = supervisor_history {
                    let newest = history.iter().map(|m| m.sequence).max();
                    self.reconciler.apply_history("supervisor", history, newest);
                }
            }
            ServerMessage::SessionSubscribed {
                session_id,
                history,
                streaming_message_id,
                current_streaming_blocks,
                ..
            } => {
                self.sync.note_subscribed(&session_id);
                let newest = history.iter().map(|m| m.sequence).max();
                self.reconciler.apply_history(&session_id, history, newest);
                if let Some(streaming_id) = streaming_message_id {
                    self.sync.streaming.update(|streams| {
                        streams.retain(|s| s.session_id != session_id);
                        streams.push(tiflis_protocol::StreamingSnapshot {
                            session_id: session_id.clone(),
                            streaming_message_id: streaming_id.clone(),
                            content_blocks: current_streaming_blocks.clone(),
                        });
                    });
                }
            }
            ServerMessage::SupervisorOutput { event } | ServerMessage::SessionOutput { event } => {
                self.reconciler.apply_event(event, now_ms());
            }
            ServerMessage::SupervisorUserMessage { message }
            | ServerMessage::SessionUserMessage { message, .. } => {
                self.store.apply_record(message);
            }
            ServerMessage::SessionReplayData {
                session_id, events, ..
            } => {
                self.reconciler.apply_replay(&session_id, events);
            }
            ServerMessage::HistoryResponse {
                session_id,
                history,
                newest_sequence,
                ..
            } => {
                self.reconciler
                    .apply_history(&session_id, history, newest_sequence);
            }
            ServerMessage::MessageAck { message_id, .. } => {
                self.reconciler.on_ack(&message_id);
            }
            ServerMessage::AudioResponse {
                message_id, data, ..
            } => {
                self.audio.on_response(&message_id, data.as_deref());
            }
            ServerMessage::SessionCreated { session } => {
                self.sync.on_session_created(session);
            }
            ServerMessage::SessionTerminated { session_id, .. } => {
                self.sync.on_session_terminated(&session_id);
                self.reconciler.remove_session(&session_id);
                self.sender.cancel_pending_for_session(&session_id);
            }
            ServerMessage::Error {
                payload,
                session_id,
            } => {
                warn!(
                    "Server error{}: {payload}",
                    session_id
                        .map(|s| format!(" for {s}"))
                        .unwrap_or_default()
                );
            }
            _ => {}
        }
    }

    fn on_state_change(&self, state: &ConnectionState) {
        if let Some(relay) = self.relay() {
            relay.on_connection_state(state);
        }
        if state.is_sendable() {
            // Drain the offline queue as soon as sends are possible again.
            let sender = Arc::clone(&self.sender);
            tokio::spawn(async move {
                sender.drain().await;
            });
        }
    }
}

/// Forward one watch frame into the backbone (phone side of the relay).
pub async fn forward_watch_frame(root: &Arc<ClientRoot>, frame: tiflis_protocol::RelayFrame) {
    let Some(relay) = root.relay() else { return };
    let state = root.connection.state();
    if let Some(inbound) = relay.on_watch_frame(frame, &state) {
        let Inbound { id, message, .. } = inbound;
        let mut config = CommandConfig::new(message);
        if let Some(id) = id {
            config = config.with_request_id(id);
        }
        let _ = root.sender.send(config).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiflis_protocol::{AckStatus, ContentBlock, SequencedEvent};

    fn root() -> Arc<ClientRoot> {
        ClientRoot::new(ClientConfig::new(
            "ws://127.0.0.1:1/ws",
            "t-test",
            "K-test",
            "D-test",
        ))
    }

    fn output(session: &str, seq: u64, stream_id: &str, complete: bool) -> Outbound {
        Outbound::new(ServerMessage::SessionOutput {
            event: SequencedEvent {
                session_id: session.into(),
                sequence: seq,
                streaming_message_id: Some(stream_id.into()),
                content_type: ContentType::Text,
                content: format!("frame {seq}"),
                content_blocks: vec![ContentBlock::text("b1", format!("frame {seq}"))],
                is_complete: complete,
                timestamp: 0,
            },
        })
    }

    #[tokio::test]
    async fn frames_flow_into_the_store() {
        let root = root();
        root.on_frame(output("claude-abc12345", 1, "s-1", false));
        root.on_frame(output("claude-abc12345", 2, "s-1", true));
        let messages = root.store.messages("claude-abc12345");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].record.is_complete);
    }

    #[tokio::test]
    async fn acks_resolve_locally_sent_messages() {
        let root = root();
        // Queue-path execute: connection is down, so the send queues, but
        // the local record exists and is pending.
        let (message_id, outcome) = root.execute("claude-abc12345", "ls").await;
        assert_eq!(outcome, SendOutcome::Queued);
        root.on_frame(Outbound::new(ServerMessage::MessageAck {
            message_id: message_id.clone(),
            status: AckStatus::Received,
        }));
        let message = root.store.get("claude-abc12345", &message_id).unwrap();
        assert_eq!(message.delivery, crate::store::DeliveryState::Confirmed);
    }

    #[tokio::test]
    async fn terminated_sessions_clear_pending_commands() {
        let root = root();
        root.subscribe("claude-abc12345").await; // queued (disconnected)
        root.execute("claude-abc12345", "ls").await;
        assert!(root.sender.pending_command_count() >= 2);

        root.on_frame(Outbound::new(ServerMessage::SessionTerminated {
            session_id: "claude-abc12345".into(),
            reason: None,
            error: None,
        }));
        assert_eq!(root.sender.pending_command_count(), 0);
        assert!(root.sync.subscriptions().is_empty());
    }
}
