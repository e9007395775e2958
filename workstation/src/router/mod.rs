//! Subscription graph and output fan-out.
//!
//! [`OutputRouter`] keeps the device↔session subscription edges in two
//! indices that are always updated together, assigns every output frame its
//! per-session sequence number, persists it, and delivers it to every
//! subscribed device's bounded queue.
//!
//! ## Ordering
//!
//! Sequence allocation, log append, and enqueue-to-subscribers happen under
//! one async mutex per session id, so devices observe a session's frames in
//! emission order. Nothing is guaranteed across sessions. Subscription
//! snapshots are built under the same lock, which is what makes them reflect
//! a single consistent instant.
//!
//! ## Slow subscribers
//!
//! Delivery uses `try_send` into a bounded queue (default 256). A device
//! whose queue overflows is dropped on the spot — its transport pump sees
//! the closed queue and tears the connection down, and the device is
//! expected to reconnect and re-sync.

pub mod fanout;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use tiflis_protocol::{
    ContentBlock, ContentType, ErrorCode, ErrorPayload, MessageRecord, Outbound, Role,
    SequencedEvent, ServerMessage, SessionKind, StreamingSnapshot, WorkspaceInfo,
};

use crate::registry::{SessionRegistry, SUPERVISOR_SESSION_ID};
use crate::store::{MessageDraft, MessageStore, RingStore};
use crate::util::now_ms;
use fanout::{DeviceSink, SinkError};

/// One output frame before sequence assignment.
#[derive(Debug, Clone)]
pub struct OutputDraft {
    pub session_id: String,
    pub role: Role,
    pub content_type: ContentType,
    pub content: String,
    pub content_blocks: Vec<ContentBlock>,
    pub streaming_message_id: Option<String>,
    pub is_complete: bool,
}

/// In-progress stream for one session.
#[derive(Debug, Clone)]
struct StreamingState {
    streaming_message_id: String,
    content_blocks: Vec<ContentBlock>,
}

struct RouterInner {
    by_device: HashMap<String, HashSet<String>>,
    by_session: HashMap<String, HashSet<String>>,
    sinks: HashMap<String, DeviceSink>,
    session_locks: HashMap<String, Arc<Mutex<()>>>,
    streaming: HashMap<String, StreamingState>,
}

/// The sole writer of sequence numbers and the fan-out hub.
#[derive(Clone)]
pub struct OutputRouter {
    inner: Arc<RwLock<RouterInner>>,
    store: Arc<MessageStore>,
    rings: RingStore,
    registry: SessionRegistry,
    queue_size: usize,
    history_page_size: u32,
    workspaces: Vec<WorkspaceInfo>,
}

impl OutputRouter {
    pub fn new(
        store: Arc<MessageStore>,
        rings: RingStore,
        registry: SessionRegistry,
        queue_size: usize,
        history_page_size: u32,
        workspaces: Vec<WorkspaceInfo>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RouterInner {
                by_device: HashMap::new(),
                by_session: HashMap::new(),
                sinks: HashMap::new(),
                session_locks: HashMap::new(),
                streaming: HashMap::new(),
            })),
            store,
            rings,
            registry,
            queue_size,
            history_page_size,
            workspaces,
        }
    }

    // -------------------------------------------------------------------
    // Device lifecycle
    // -------------------------------------------------------------------

    /// Attach a device, returning the queue its transport must pump. A
    /// reconnecting device replaces its old sink; the stale pump sees a
    /// closed queue and exits.
    pub async fn register_device(&self, device_id: &str) -> mpsc::Receiver<Outbound> {
        let (sink, rx) = DeviceSink::new(device_id, self.queue_size);
        let mut inner = self.inner.write().await;
        inner.sinks.insert(device_id.to_string(), sink);
        inner
            .by_device
            .entry(device_id.to_string())
            .or_default();
        rx
    }

    /// Detach a device's sink. Subscription edges persist in the store and
    /// are restored on the next successful auth.
    pub async fn unregister_device(&self, device_id: &str) {
        let mut inner = self.inner.write().await;
        inner.sinks.remove(device_id);
        if let Some(sessions) = inner.by_device.remove(device_id) {
            for session_id in sessions {
                if let Some(devices) = inner.by_session.get_mut(&session_id) {
                    devices.remove(device_id);
                }
            }
        }
    }

    /// Deliver one frame to one device. Overflow drops the device.
    pub async fn send_to_device(&self, device_id: &str, frame: Outbound) {
        let result = {
            let inner = self.inner.read().await;
            match inner.sinks.get(device_id) {
                Some(sink) => sink.send(frame),
                None => return,
            }
        };
        if let Err(e) = result {
            self.handle_sink_error(device_id, e).await;
        }
    }

    async fn handle_sink_error(&self, device_id: &str, error: SinkError) {
        match error {
            SinkError::Overflow => {
                warn!("Device {device_id} overflowed its queue, dropping (must reconnect)");
                self.unregister_device(device_id).await;
            }
            SinkError::Closed => {
                self.unregister_device(device_id).await;
            }
        }
    }

    // -------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------

    /// Subscribe a device to a session and build its snapshot. Idempotent —
    /// repeated calls leave exactly one edge.
    ///
    /// The snapshot (metadata, executing flag, streaming blocks, recent
    /// history) is assembled under the session's broadcast lock so it cannot
    /// interleave with a concurrent output frame.
    pub async fn subscribe(
        &self,
        device_id: &str,
        session_id: &str,
    ) -> Result<ServerMessage, ErrorPayload> {
        let Some(session) = self.registry.get_session(session_id).await else {
            return Err(ErrorPayload::new(
                ErrorCode::SessionNotFound,
                format!("Session {session_id} not found"),
            ));
        };

        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        {
            let mut inner = self.inner.write().await;
            inner
                .by_device
                .entry(device_id.to_string())
                .or_default()
                .insert(session_id.to_string());
            inner
                .by_session
                .entry(session_id.to_string())
                .or_default()
                .insert(device_id.to_string());
        }
        if let Err(e) = self.store.add_subscription(device_id, session_id) {
            warn!("Persisting subscription {device_id}:{session_id} failed: {e}");
        }

        let is_executing = self.registry.is_executing(session_id).await;
        let streaming = {
            let inner = self.inner.read().await;
            inner.streaming.get(session_id).cloned()
        };
        let history = if session.kind == SessionKind::Terminal {
            Vec::new()
        } else {
            self.store
                .read_page(session_id, None, self.history_page_size)
                .map_err(internal_error)?
                .messages
        };

        Ok(ServerMessage::SessionSubscribed {
            session_id: session_id.to_string(),
            session,
            is_executing,
            history,
            streaming_message_id: streaming.as_ref().map(|s| s.streaming_message_id.clone()),
            current_streaming_blocks: streaming.map(|s| s.content_blocks).unwrap_or_default(),
        })
    }

    /// Remove one subscription edge. Idempotent.
    pub async fn unsubscribe(&self, device_id: &str, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(sessions) = inner.by_device.get_mut(device_id) {
            sessions.remove(session_id);
        }
        if let Some(devices) = inner.by_session.get_mut(session_id) {
            devices.remove(device_id);
        }
        drop(inner);
        if let Err(e) = self.store.remove_subscription(device_id, session_id) {
            warn!("Removing subscription {device_id}:{session_id} failed: {e}");
        }
    }

    /// Re-establish a device's persisted subscriptions after auth. Edges to
    /// sessions that no longer exist are pruned. Returns the restored ids.
    pub async fn restore_subscriptions(&self, device_id: &str) -> Vec<String> {
        let persisted = match self.store.subscriptions_for_device(device_id) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Loading subscriptions for {device_id} failed: {e}");
                return Vec::new();
            }
        };
        let mut restored = Vec::new();
        for session_id in persisted {
            if self.registry.get_session(&session_id).await.is_none() {
                if let Err(e) = self.store.remove_subscription(device_id, &session_id) {
                    warn!("Pruning dead subscription {device_id}:{session_id} failed: {e}");
                }
                continue;
            }
            let mut inner = self.inner.write().await;
            inner
                .by_device
                .entry(device_id.to_string())
                .or_default()
                .insert(session_id.clone());
            inner
                .by_session
                .entry(session_id.clone())
                .or_default()
                .insert(device_id.to_string());
            restored.push(session_id);
        }
        restored
    }

    /// Devices currently subscribed to a session.
    pub async fn subscribers_of(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .by_session
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------

    /// Assign the next sequence, persist, and fan out one output frame.
    pub async fn broadcast_output(&self, draft: OutputDraft) -> Result<SequencedEvent, ErrorPayload> {
        let session_id = draft.session_id.clone();
        let kind = self
            .registry
            .kind_of(&session_id)
            .await
            .ok_or_else(|| {
                ErrorPayload::new(
                    ErrorCode::SessionNotFound,
                    format!("Session {session_id} not found"),
                )
            })?;

        let lock = self.session_lock(&session_id).await;
        let _guard = lock.lock().await;

        let event = if kind == SessionKind::Terminal {
            let entry = self.rings.push(&session_id, draft.content.clone()).await;
            SequencedEvent {
                session_id: session_id.clone(),
                sequence: entry.sequence,
                streaming_message_id: None,
                content_type: draft.content_type,
                content: draft.content,
                content_blocks: Vec::new(),
                is_complete: true,
                timestamp: entry.timestamp,
            }
        } else {
            let message_id = draft
                .streaming_message_id
                .clone()
                .unwrap_or_else(|| format!("m-{}", crate::util::nonce8()));
            let record = self
                .store
                .append(&MessageDraft {
                    id: message_id,
                    session_id: session_id.clone(),
                    role: draft.role,
                    content_type: draft.content_type,
                    content: draft.content.clone(),
                    content_blocks: draft.content_blocks.clone(),
                    is_complete: draft.is_complete,
                })
                .map_err(internal_error)?;

            // Maintain the per-session streaming state used by snapshots.
            let mut inner = self.inner.write().await;
            if let Some(streaming_id) = &draft.streaming_message_id {
                if draft.is_complete {
                    inner.streaming.remove(&session_id);
                } else {
                    inner.streaming.insert(
                        session_id.clone(),
                        StreamingState {
                            streaming_message_id: streaming_id.clone(),
                            content_blocks: draft.content_blocks.clone(),
                        },
                    );
                }
            }
            drop(inner);

            SequencedEvent {
                session_id: session_id.clone(),
                sequence: record.sequence,
                streaming_message_id: draft.streaming_message_id,
                content_type: draft.content_type,
                content: draft.content,
                content_blocks: draft.content_blocks,
                is_complete: draft.is_complete,
                timestamp: record.created_at,
            }
        };

        let message = if kind == SessionKind::Supervisor {
            ServerMessage::SupervisorOutput {
                event: event.clone(),
            }
        } else {
            ServerMessage::SessionOutput {
                event: event.clone(),
            }
        };
        self.fan_out(&session_id, message, None).await;
        Ok(event)
    }

    /// Mirror a durably accepted user message to the session's other
    /// subscribers.
    pub async fn broadcast_user_message(&self, record: MessageRecord, exclude_device: &str) {
        let session_id = record.session_id.clone();
        let message = if session_id == SUPERVISOR_SESSION_ID {
            ServerMessage::SupervisorUserMessage { message: record }
        } else {
            ServerMessage::SessionUserMessage {
                session_id: session_id.clone(),
                message: record,
            }
        };
        self.fan_out(&session_id, message, Some(exclude_device)).await;
    }

    /// Send an event to every subscriber of a session.
    pub async fn broadcast_to_session(&self, session_id: &str, message: ServerMessage) {
        self.fan_out(session_id, message, None).await;
    }

    /// Send an event to every connected device (session lifecycle).
    pub async fn broadcast_all(&self, message: ServerMessage) {
        let targets: Vec<String> = {
            let inner = self.inner.read().await;
            inner.sinks.keys().cloned().collect()
        };
        for device_id in targets {
            self.send_to_device(&device_id, Outbound::new(message.clone()))
                .await;
        }
    }

    async fn fan_out(&self, session_id: &str, message: ServerMessage, exclude: Option<&str>) {
        let mut overflowed = Vec::new();
        {
            let inner = self.inner.read().await;
            let Some(devices) = inner.by_session.get(session_id) else {
                return;
            };
            for device_id in devices {
                if exclude == Some(device_id.as_str()) {
                    continue;
                }
                let Some(sink) = inner.sinks.get(device_id) else {
                    continue;
                };
                if let Err(e) = sink.send(Outbound::new(message.clone())) {
                    overflowed.push((device_id.clone(), e));
                }
            }
        }
        for (device_id, e) in overflowed {
            self.handle_sink_error(&device_id, e).await;
        }
    }

    // -------------------------------------------------------------------
    // Replay & history
    // -------------------------------------------------------------------

    /// Ordered events with `sequence > since` (or from a timestamp).
    /// `limit` is capped at the store's replay maximum.
    pub async fn replay(
        &self,
        session_id: &str,
        since_sequence: Option<u64>,
        since_timestamp: Option<u64>,
        limit: u32,
    ) -> Result<(Vec<SequencedEvent>, bool), ErrorPayload> {
        let kind = self.registry.kind_of(session_id).await.ok_or_else(|| {
            ErrorPayload::new(
                ErrorCode::SessionNotFound,
                format!("Session {session_id} not found"),
            )
        })?;

        if kind == SessionKind::Terminal {
            let since = since_sequence.unwrap_or(0);
            let (entries, has_more) = self
                .rings
                .read_since(session_id, since, limit.clamp(1, crate::store::log::REPLAY_LIMIT_MAX) as usize)
                .await;
            let events = entries
                .into_iter()
                .map(|e| SequencedEvent {
                    session_id: session_id.to_string(),
                    sequence: e.sequence,
                    streaming_message_id: None,
                    content_type: ContentType::Text,
                    content: e.data,
                    content_blocks: Vec::new(),
                    is_complete: true,
                    timestamp: e.timestamp,
                })
                .collect();
            return Ok((events, has_more));
        }

        let (records, has_more) = match (since_sequence, since_timestamp) {
            (Some(seq), _) => self
                .store
                .replay_since(session_id, seq, limit)
                .map_err(internal_error)?,
            (None, Some(ts)) => self
                .store
                .replay_since_timestamp(session_id, ts, limit)
                .map_err(internal_error)?,
            (None, None) => self
                .store
                .replay_since(session_id, 0, limit)
                .map_err(internal_error)?,
        };
        Ok((
            records.into_iter().map(record_to_event).collect(),
            has_more,
        ))
    }

    /// One lazily loaded history page plus current execution state.
    pub async fn history(
        &self,
        session_id: &str,
        before_sequence: Option<u64>,
        limit: Option<u32>,
    ) -> Result<ServerMessage, ErrorPayload> {
        if self.registry.get_session(session_id).await.is_none() {
            return Err(ErrorPayload::new(
                ErrorCode::SessionNotFound,
                format!("Session {session_id} not found"),
            ));
        }
        let page = self
            .store
            .read_page(
                session_id,
                before_sequence,
                limit.unwrap_or(self.history_page_size),
            )
            .map_err(internal_error)?;
        let is_executing = self.registry.is_executing(session_id).await;
        let streaming = {
            let inner = self.inner.read().await;
            inner.streaming.get(session_id).cloned()
        };
        Ok(ServerMessage::HistoryResponse {
            session_id: session_id.to_string(),
            history: page.messages,
            has_more: page.has_more,
            oldest_sequence: page.oldest_sequence,
            newest_sequence: page.newest_sequence,
            is_executing,
            streaming_message_id: streaming.as_ref().map(|s| s.streaming_message_id.clone()),
            current_streaming_blocks: streaming.map(|s| s.content_blocks).unwrap_or_default(),
        })
    }

    // -------------------------------------------------------------------
    // Sync & teardown
    // -------------------------------------------------------------------

    /// Full or lightweight sync state for one device.
    pub async fn sync_state(&self, device_id: &str, lightweight: bool) -> ServerMessage {
        let sessions = self.registry.list_active().await;
        let subscriptions = self
            .store
            .subscriptions_for_device(device_id)
            .unwrap_or_default();
        let supervisor_history = if lightweight {
            None
        } else {
            self.store
                .read_page(SUPERVISOR_SESSION_ID, None, self.history_page_size)
                .ok()
                .map(|page| page.messages)
        };
        let streaming = {
            let inner = self.inner.read().await;
            inner
                .streaming
                .iter()
                .map(|(session_id, s)| StreamingSnapshot {
                    session_id: session_id.clone(),
                    streaming_message_id: s.streaming_message_id.clone(),
                    content_blocks: s.content_blocks.clone(),
                })
                .collect()
        };
        ServerMessage::SyncState {
            sessions,
            subscriptions,
            supervisor_history,
            streaming,
            agent_aliases: self.registry.agent_aliases(),
            hidden_base_types: self.registry.hidden_base_types(),
            workspaces: self.workspaces.clone(),
        }
    }

    /// Notify subscribers of a termination, then drop every edge and cached
    /// state for the session.
    pub async fn session_terminated(
        &self,
        session_id: &str,
        reason: Option<String>,
        error: Option<ErrorCode>,
    ) {
        self.fan_out(
            session_id,
            ServerMessage::SessionTerminated {
                session_id: session_id.to_string(),
                reason,
                error,
            },
            None,
        )
        .await;

        let mut inner = self.inner.write().await;
        if let Some(devices) = inner.by_session.remove(session_id) {
            for device_id in devices {
                if let Some(sessions) = inner.by_device.get_mut(&device_id) {
                    sessions.remove(session_id);
                }
            }
        }
        inner.session_locks.remove(session_id);
        inner.streaming.remove(session_id);
        drop(inner);

        self.rings.remove(session_id).await;
        if let Err(e) = self.store.remove_subscriptions_for_session(session_id) {
            warn!("Dropping subscriptions for {session_id} failed: {e}");
        }
        if let Err(e) = self.store.mark_session_terminated(session_id) {
            warn!("Marking {session_id} terminated failed: {e}");
        }
        info!("Session {session_id} unsubscribed from all devices");
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut inner = self.inner.write().await;
        Arc::clone(
            inner
                .session_locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// A stored record replayed as a wire event.
fn record_to_event(record: MessageRecord) -> SequencedEvent {
    SequencedEvent {
        sequence: record.sequence,
        streaming_message_id: Some(record.id),
        session_id: record.session_id,
        content_type: record.content_type,
        content: record.content,
        content_blocks: record.content_blocks,
        is_complete: record.is_complete,
        timestamp: record.created_at,
    }
}

fn internal_error(e: crate::store::StoreError) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::InternalError, e.to_string())
}
