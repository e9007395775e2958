//! Connection state machine and the WebSocket shell around it.
//!
//! The pure transition logic lives in [`ConnectionCore`] so every edge of
//! the machine is testable without a socket; [`Connection`] wraps it with
//! tokio-tungstenite I/O, the heartbeat loop, and jittered reconnect
//! backoff.
//!
//! ```text
//! disconnected ──open──▶ connecting ──ws-open──▶ connected
//! connected ──send(auth)──▶ authenticating
//! authenticating ──auth.success──▶ authenticated ──heartbeat-ok──▶ verified
//! verified ──heartbeat-miss──▶ degraded ──heartbeat-ok──▶ verified
//! any ──ws-close / error──▶ reconnecting(attempt+1) ──backoff──▶ connecting
//! any ──user-disconnect──▶ disconnected
//! authenticating ──auth.error──▶ error(msg)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tiflis_protocol::{codec, ClientMessage, Inbound, Outbound, ServerMessage};

use crate::config::ClientConfig;
use crate::observable::Observable;

/// Consecutive heartbeat misses before the connection is considered
/// degraded.
pub const DEGRADED_MISS_THRESHOLD: u32 = 2;
/// Consecutive heartbeat misses before a reconnect is forced.
pub const RECONNECT_MISS_THRESHOLD: u32 = 4;

/// Client connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Tunnel open, not yet authenticated.
    Connected,
    Authenticating,
    /// Auth accepted, awaiting the first heartbeat round-trip.
    Authenticated,
    /// Heartbeat round-trip succeeded.
    Verified,
    /// Authenticated but heartbeats are failing; sends still permitted.
    Degraded,
    Reconnecting(u32),
    /// Terminal failure (bad credentials, protocol mismatch). No retries.
    Error(String),
}

impl ConnectionState {
    /// Tunnel-level connectivity, used for presence UI.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticated | Self::Verified | Self::Degraded
        )
    }

    /// Whether commands may be sent right now.
    pub fn is_sendable(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Verified | Self::Degraded)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// `connect()` was called or a backoff elapsed.
    Open,
    /// The WebSocket (and tunnel handshake) completed.
    TransportOpened,
    /// The `auth` frame went out.
    AuthRequested,
    AuthSucceeded,
    AuthFailed(String),
    HeartbeatAcked,
    HeartbeatMissed,
    /// Socket closed or errored.
    TransportFailed,
    UserDisconnected,
}

/// Pure transition core. All I/O-driven edges arrive as [`ConnEvent`]s.
#[derive(Debug)]
pub struct ConnectionCore {
    state: ConnectionState,
    consecutive_misses: u32,
    reconnect_attempt: u32,
}

impl ConnectionCore {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_misses: 0,
            reconnect_attempt: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Apply one event and return the new state.
    pub fn apply(&mut self, event: ConnEvent) -> ConnectionState {
        use ConnectionState as S;
        let next = match (&self.state, event) {
            // A terminal error only leaves through an explicit disconnect.
            (S::Error(_), ConnEvent::UserDisconnected) => S::Disconnected,
            (S::Error(msg), _) => S::Error(msg.clone()),

            (_, ConnEvent::UserDisconnected) => {
                self.consecutive_misses = 0;
                self.reconnect_attempt = 0;
                S::Disconnected
            }
            (S::Disconnected | S::Reconnecting(_), ConnEvent::Open) => S::Connecting,
            (S::Connecting, ConnEvent::TransportOpened) => S::Connected,
            (S::Connected, ConnEvent::AuthRequested) => S::Authenticating,
            (S::Authenticating, ConnEvent::AuthSucceeded) => {
                self.consecutive_misses = 0;
                self.reconnect_attempt = 0;
                S::Authenticated
            }
            (S::Authenticating, ConnEvent::AuthFailed(msg)) => S::Error(msg),
            (
                S::Authenticated | S::Verified | S::Degraded,
                ConnEvent::HeartbeatAcked,
            ) => {
                self.consecutive_misses = 0;
                S::Verified
            }
            (
                S::Authenticated | S::Verified | S::Degraded,
                ConnEvent::HeartbeatMissed,
            ) => {
                self.consecutive_misses += 1;
                if self.consecutive_misses >= RECONNECT_MISS_THRESHOLD {
                    self.consecutive_misses = 0;
                    self.reconnect_attempt += 1;
                    S::Reconnecting(self.reconnect_attempt)
                } else if self.consecutive_misses >= DEGRADED_MISS_THRESHOLD {
                    S::Degraded
                } else {
                    self.state.clone()
                }
            }
            (S::Disconnected, ConnEvent::TransportFailed) => S::Disconnected,
            (_, ConnEvent::TransportFailed) => {
                self.reconnect_attempt += 1;
                S::Reconnecting(self.reconnect_attempt)
            }
            // Everything else keeps the current state.
            (state, _) => state.clone(),
        };
        self.state = next.clone();
        next
    }
}

impl Default for ConnectionCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff for `attempt` (1-based): `min · 2^(attempt-1)` capped at `max`,
/// with ±25% jitter.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = min.saturating_mul(2u32.saturating_pow(exponent)).min(max);
    let factor: f64 = rand::rng().random_range(0.75..=1.25);
    base.mul_f64(factor)
}

/// The sender-facing surface of a connection: an atomic state sample plus a
/// non-blocking frame enqueue.
pub trait CommandTransport: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn send_frame(&self, frame: Inbound) -> Result<(), String>;
}

/// Consumer of inbound frames and state changes, wired by the application
/// root.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: Outbound);
    fn on_state_change(&self, state: &ConnectionState);
}

struct ConnectionShared {
    config: ClientConfig,
    core: Mutex<ConnectionCore>,
    state: Observable<ConnectionState>,
    writer: Mutex<Option<mpsc::Sender<Inbound>>>,
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    cancel: CancellationToken,
}

/// Tunnel WebSocket connection with auto-reconnect and heartbeat.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                config,
                core: Mutex::new(ConnectionCore::new()),
                state: Observable::new(ConnectionState::Disconnected),
                writer: Mutex::new(None),
                handler: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Wire the frame consumer. Must happen before [`Connection::connect`].
    pub fn set_handler(&self, handler: Arc<dyn FrameHandler>) {
        *lock(&self.shared.handler) = Some(handler);
    }

    /// Observable connection state for UI binding.
    pub fn state_observable(&self) -> &Observable<ConnectionState> {
        &self.shared.state
    }

    /// Start the connection loop. Returns immediately; progress is visible
    /// through the state observable.
    pub fn connect(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_loop(shared));
    }

    /// Tear down for good (user-initiated).
    pub fn disconnect(&self) {
        self.shared.cancel.cancel();
        apply_event(&self.shared, ConnEvent::UserDisconnected);
    }
}

impl CommandTransport for Connection {
    fn state(&self) -> ConnectionState {
        self.shared.state.snapshot()
    }

    fn send_frame(&self, frame: Inbound) -> Result<(), String> {
        let writer = lock(&self.shared.writer);
        match writer.as_ref() {
            Some(tx) => tx
                .try_send(frame)
                .map_err(|_| "socket writer unavailable".to_string()),
            None => Err("not connected".to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn apply_event(shared: &Arc<ConnectionShared>, event: ConnEvent) -> ConnectionState {
    let next = lock(&shared.core).apply(event);
    shared.state.set(next.clone());
    let handler = lock(&shared.handler).clone();
    if let Some(handler) = handler {
        handler.on_state_change(&next);
    }
    next
}

async fn run_loop(shared: Arc<ConnectionShared>) {
    loop {
        if shared.cancel.is_cancelled() {
            return;
        }
        apply_event(&shared, ConnEvent::Open);

        match run_once(&shared).await {
            SessionEnd::Fatal => return,
            SessionEnd::Dropped => {
                apply_event(&shared, ConnEvent::TransportFailed);
            }
            SessionEnd::Reconnect => {
                // Core already moved to Reconnecting via heartbeat misses.
            }
        }

        let attempt = match shared.state.snapshot() {
            ConnectionState::Reconnecting(n) => n,
            ConnectionState::Error(_) | ConnectionState::Disconnected => return,
            _ => 1,
        };
        let delay = backoff_delay(
            attempt,
            shared.config.reconnect_min_delay,
            shared.config.reconnect_max_delay,
        );
        debug!("Reconnecting in {delay:?} (attempt {attempt})");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.cancel.cancelled() => return,
        }
    }
}

enum SessionEnd {
    /// Terminal: auth rejected, user disconnect, or protocol mismatch.
    Fatal,
    /// Socket died; count a reconnect attempt.
    Dropped,
    /// Heartbeat watchdog forced a reconnect; attempt already counted.
    Reconnect,
}

async fn run_once(shared: &Arc<ConnectionShared>) -> SessionEnd {
    let config = &shared.config;

    let connect = tokio::time::timeout(
        Duration::from_secs(15),
        tokio_tungstenite::connect_async(&config.url),
    )
    .await;
    let ws = match connect {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!("Connect failed: {e}");
            return SessionEnd::Dropped;
        }
        Err(_) => {
            warn!("Connect timed out");
            return SessionEnd::Dropped;
        }
    };
    let (mut ws_sink, mut ws_stream) = ws.split();

    // Tunnel handshake.
    let hello = Inbound::new(ClientMessage::Connect {
        tunnel_id: config.tunnel_id.clone(),
        auth_key: config.auth_key.clone(),
        device_id: config.device_id.clone(),
        reconnect: lock(&shared.core).reconnect_attempt() > 0,
    });
    if send_frame_on(&mut ws_sink, &hello).await.is_err() {
        return SessionEnd::Dropped;
    }

    // Single-writer funnel for this socket.
    let (out_tx, mut out_rx) = mpsc::channel::<Inbound>(64);
    *lock(&shared.writer) = Some(out_tx);

    // Heartbeat bookkeeping: id → sent-at. A pending entry older than twice
    // the interval counts as one miss.
    let mut pending_acks: HashMap<String, tokio::time::Instant> = HashMap::new();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ack_deadline = config.heartbeat_interval * 2;

    let end = loop {
        tokio::select! {
            () = shared.cancel.cancelled() => {
                apply_event(shared, ConnEvent::UserDisconnected);
                break SessionEnd::Fatal;
            }
            inbound = ws_stream.next() => {
                let Some(Ok(msg)) = inbound else {
                    break SessionEnd::Dropped;
                };
                match msg {
                    Message::Text(text) => {
                        match handle_inbound(shared, &mut pending_acks, &text) {
                            InboundOutcome::Continue => {}
                            InboundOutcome::Fatal => break SessionEnd::Fatal,
                        }
                    }
                    Message::Close(_) => break SessionEnd::Dropped,
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                }
            }
            outbound = out_rx.recv() => {
                let Some(frame) = outbound else { break SessionEnd::Dropped };
                if send_frame_on(&mut ws_sink, &frame).await.is_err() {
                    break SessionEnd::Dropped;
                }
            }
            _ = heartbeat.tick() => {
                if !shared.state.snapshot().is_sendable() {
                    continue;
                }
                // Expire overdue acks first.
                let now = tokio::time::Instant::now();
                let overdue: Vec<String> = pending_acks
                    .iter()
                    .filter(|(_, sent)| now.duration_since(**sent) >= ack_deadline)
                    .map(|(id, _)| id.clone())
                    .collect();
                let mut forced = false;
                for id in overdue {
                    pending_acks.remove(&id);
                    let state = apply_event(shared, ConnEvent::HeartbeatMissed);
                    if matches!(state, ConnectionState::Reconnecting(_)) {
                        forced = true;
                    }
                }
                if forced {
                    break SessionEnd::Reconnect;
                }
                let id = uuid::Uuid::new_v4().simple().to_string();
                let frame = Inbound::new(ClientMessage::Heartbeat {
                    timestamp: crate::store::now_ms(),
                })
                .with_id(id.clone());
                if send_frame_on(&mut ws_sink, &frame).await.is_err() {
                    break SessionEnd::Dropped;
                }
                pending_acks.insert(id, now);
            }
        }
    };

    *lock(&shared.writer) = None;
    end
}

enum InboundOutcome {
    Continue,
    Fatal,
}

fn handle_inbound(
    shared: &Arc<ConnectionShared>,
    pending_acks: &mut HashMap<String, tokio::time::Instant>,
    text: &str,
) -> InboundOutcome {
    let frame = match codec::decode_outbound(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("Undecodable frame: {e}");
            return InboundOutcome::Continue;
        }
    };

    match &frame.message {
        ServerMessage::Connected {
            protocol_version, ..
        } => {
            if !tiflis_protocol::versions_compatible(
                tiflis_protocol::PROTOCOL_VERSION,
                protocol_version,
            ) {
                apply_event(
                    shared,
                    ConnEvent::AuthFailed(format!(
                        "protocol mismatch: workstation {protocol_version}, client {}",
                        tiflis_protocol::PROTOCOL_VERSION
                    )),
                );
                return InboundOutcome::Fatal;
            }
            apply_event(shared, ConnEvent::TransportOpened);
            // Authenticate immediately after the tunnel handshake.
            let auth = Inbound::new(ClientMessage::Auth {
                auth_key: shared.config.auth_key.clone(),
                device_id: shared.config.device_id.clone(),
            });
            let sent = {
                let writer = lock(&shared.writer);
                writer
                    .as_ref()
                    .map(|tx| tx.try_send(auth).is_ok())
                    .unwrap_or(false)
            };
            if sent {
                apply_event(shared, ConnEvent::AuthRequested);
            }
        }
        ServerMessage::AuthSuccess { .. } => {
            info!("Authenticated");
            apply_event(shared, ConnEvent::AuthSucceeded);
        }
        ServerMessage::AuthError { message, .. } => {
            warn!("Auth rejected: {message}");
            apply_event(shared, ConnEvent::AuthFailed(message.clone()));
            return InboundOutcome::Fatal;
        }
        ServerMessage::HeartbeatAck { .. } => {
            if let Some(id) = &frame.id {
                if pending_acks.remove(id).is_some() {
                    apply_event(shared, ConnEvent::HeartbeatAcked);
                }
            }
        }
        _ => {}
    }

    let handler = lock(&shared.handler).clone();
    if let Some(handler) = handler {
        handler.on_frame(frame);
    }
    InboundOutcome::Continue
}

async fn send_frame_on<S>(sink: &mut S, frame: &Inbound) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = codec::encode_inbound(frame).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticated_core() -> ConnectionCore {
        let mut core = ConnectionCore::new();
        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::TransportOpened);
        core.apply(ConnEvent::AuthRequested);
        core.apply(ConnEvent::AuthSucceeded);
        core
    }

    #[test]
    fn happy_path_reaches_verified() {
        let mut core = authenticated_core();
        assert_eq!(*core.state(), ConnectionState::Authenticated);
        assert!(core.state().is_sendable());
        core.apply(ConnEvent::HeartbeatAcked);
        assert_eq!(*core.state(), ConnectionState::Verified);
    }

    #[test]
    fn two_misses_degrade_four_force_reconnect() {
        let mut core = authenticated_core();
        core.apply(ConnEvent::HeartbeatAcked);

        core.apply(ConnEvent::HeartbeatMissed);
        assert_eq!(*core.state(), ConnectionState::Verified);
        core.apply(ConnEvent::HeartbeatMissed);
        assert_eq!(*core.state(), ConnectionState::Degraded);
        assert!(core.state().is_sendable());
        core.apply(ConnEvent::HeartbeatMissed);
        assert_eq!(*core.state(), ConnectionState::Degraded);
        core.apply(ConnEvent::HeartbeatMissed);
        assert_eq!(*core.state(), ConnectionState::Reconnecting(1));
    }

    #[test]
    fn ack_recovers_from_degraded() {
        let mut core = authenticated_core();
        core.apply(ConnEvent::HeartbeatMissed);
        core.apply(ConnEvent::HeartbeatMissed);
        assert_eq!(*core.state(), ConnectionState::Degraded);
        core.apply(ConnEvent::HeartbeatAcked);
        assert_eq!(*core.state(), ConnectionState::Verified);
        // Miss counter reset: two more misses degrade again, not reconnect.
        core.apply(ConnEvent::HeartbeatMissed);
        core.apply(ConnEvent::HeartbeatMissed);
        assert_eq!(*core.state(), ConnectionState::Degraded);
    }

    #[test]
    fn auth_failure_is_terminal() {
        let mut core = ConnectionCore::new();
        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::TransportOpened);
        core.apply(ConnEvent::AuthRequested);
        core.apply(ConnEvent::AuthFailed("bad key".into()));
        assert_eq!(*core.state(), ConnectionState::Error("bad key".into()));

        // Nothing but an explicit disconnect leaves the error state.
        core.apply(ConnEvent::TransportFailed);
        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::HeartbeatAcked);
        assert!(matches!(core.state(), ConnectionState::Error(_)));
        core.apply(ConnEvent::UserDisconnected);
        assert_eq!(*core.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_failure_counts_attempts_and_auth_resets() {
        let mut core = ConnectionCore::new();
        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::TransportFailed);
        assert_eq!(*core.state(), ConnectionState::Reconnecting(1));
        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::TransportFailed);
        assert_eq!(*core.state(), ConnectionState::Reconnecting(2));

        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::TransportOpened);
        core.apply(ConnEvent::AuthRequested);
        core.apply(ConnEvent::AuthSucceeded);
        assert_eq!(core.reconnect_attempt(), 0);
    }

    #[test]
    fn connected_is_not_sendable() {
        let mut core = ConnectionCore::new();
        core.apply(ConnEvent::Open);
        core.apply(ConnEvent::TransportOpened);
        assert!(core.state().is_connected());
        assert!(!core.state().is_sendable());
    }

    #[test]
    fn backoff_doubles_and_caps_with_jitter() {
        let min = Duration::from_millis(500);
        let max = Duration::from_secs(4);
        for attempt in 1..=8 {
            let delay = backoff_delay(attempt, min, max);
            let nominal = min
                .saturating_mul(2u32.saturating_pow(attempt - 1))
                .min(max);
            let low = nominal.mul_f64(0.75);
            let high = nominal.mul_f64(1.25);
            assert!(
                delay >= low && delay <= high,
                "attempt {attempt}: {delay:?} outside [{low:?}, {high:?}]"
            );
        }
    }
}
