//! Tunnel client — outbound WebSocket from the workstation to the relay.
//!
//! Spawned on startup when `[tunnel]` is configured. Maintains a persistent
//! connection with exponential-backoff reconnect. The relay multiplexes
//! every paired device over this one socket: ingress frames carry the
//! relay-injected `device_id`, egress frames carry the target `device_id`
//! for routing. The relay's word is final — whatever a client wrote into
//! its own envelope was already overwritten on the way in.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use tiflis_protocol::{codec, ClientMessage, Inbound, Outbound, ServerMessage};

use crate::config::TunnelConfig;
use crate::state::AppState;

/// Spawn the tunnel client task. Runs until a permanent error or shutdown.
pub fn spawn(state: AppState, config: TunnelConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(tunnel_loop(state, config))
}

/// Reason a connection attempt ended.
enum ConnectError {
    /// Registration rejected — stop retrying entirely.
    Permanent(String),
    /// Network trouble — exponential backoff and retry.
    Transient(String),
}

async fn tunnel_loop(state: AppState, config: TunnelConfig) {
    let mut delay = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);

    // Single-writer funnel: per-device pumps enqueue encoded frames here,
    // the active connection drains it. Survives reconnects so device queues
    // keep buffering while the relay is unreachable.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let mut pumps: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        info!("Tunnel: connecting to relay at {}", config.url);
        match connect_and_run(&state, &config, &out_tx, &mut out_rx, &mut pumps).await {
            Ok(()) => {
                info!("Tunnel: connection closed, reconnecting...");
                delay = Duration::from_secs(config.reconnect_delay_secs);
            }
            Err(ConnectError::Permanent(msg)) => {
                error!("Tunnel: permanent error: {msg} — stopping tunnel client");
                for pump in pumps.values() {
                    pump.abort();
                }
                return;
            }
            Err(ConnectError::Transient(e)) => {
                warn!(
                    "Tunnel: connection error: {e}, reconnecting in {}s",
                    delay.as_secs()
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// One connection attempt: register, then shuttle frames until disconnect.
async fn connect_and_run(
    state: &AppState,
    config: &TunnelConfig,
    out_tx: &mpsc::Sender<Message>,
    out_rx: &mut mpsc::Receiver<Message>,
    pumps: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) -> Result<(), ConnectError> {
    let (ws_stream, _response) = tokio::time::timeout(
        Duration::from_secs(15),
        tokio_tungstenite::connect_async(&config.url),
    )
    .await
    .map_err(|_| ConnectError::Transient("connect timed out (15s)".into()))?
    .map_err(|e| ConnectError::Transient(e.to_string()))?;

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // Register as the workstation side of this tunnel id.
    let register = Inbound::new(ClientMessage::Connect {
        tunnel_id: config.tunnel_id.clone(),
        auth_key: config.tunnel_key.clone(),
        device_id: "workstation".to_string(),
        reconnect: false,
    });
    let text = codec::encode_inbound(&register).map_err(|e| ConnectError::Transient(e.to_string()))?;
    ws_sink
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectError::Transient(e.to_string()))?;

    // Wait for the relay's ack before serving traffic.
    match tokio::time::timeout(Duration::from_secs(10), ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match codec::decode_outbound(&text) {
            Ok(frame) => match frame.message {
                ServerMessage::Connected {
                    protocol_version, ..
                } => {
                    if !tiflis_protocol::versions_compatible(
                        tiflis_protocol::PROTOCOL_VERSION,
                        &protocol_version,
                    ) {
                        return Err(ConnectError::Permanent(format!(
                            "relay speaks protocol {protocol_version}, we speak {}",
                            tiflis_protocol::PROTOCOL_VERSION
                        )));
                    }
                    info!("Tunnel: registered as {}", config.tunnel_id);
                }
                ServerMessage::AuthError { message, .. } => {
                    return Err(ConnectError::Permanent(format!(
                        "registration rejected: {message}"
                    )));
                }
                other => {
                    return Err(ConnectError::Transient(format!(
                        "unexpected frame during registration: {}",
                        other.type_name()
                    )));
                }
            },
            Err(e) => {
                return Err(ConnectError::Transient(format!(
                    "invalid registration ack: {e}"
                )));
            }
        },
        Ok(Some(Ok(_))) => {
            return Err(ConnectError::Transient(
                "non-text frame during registration".into(),
            ));
        }
        Ok(Some(Err(e))) => return Err(ConnectError::Transient(e.to_string())),
        Ok(None) => {
            return Err(ConnectError::Transient(
                "connection closed during registration".into(),
            ));
        }
        Err(_) => {
            return Err(ConnectError::Transient(
                "registration ack timed out (10s)".into(),
            ));
        }
    }

    let mut keepalive = tokio::time::interval(Duration::from_secs(config.keepalive_interval_secs));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                let Some(msg) = inbound else { return Ok(()) };
                let msg = msg.map_err(|e| ConnectError::Transient(e.to_string()))?;
                match msg {
                    Message::Text(text) => {
                        handle_tunnel_text(state, out_tx, pumps, &text).await;
                    }
                    Message::Close(_) => return Ok(()),
                    Message::Ping(payload) => {
                        let _ = ws_sink.send(Message::Pong(payload)).await;
                    }
                    _ => {}
                }
            }
            outbound = out_rx.recv() => {
                let Some(frame) = outbound else { return Ok(()) };
                if ws_sink.send(frame).await.is_err() {
                    return Err(ConnectError::Transient("write failed".into()));
                }
            }
            _ = keepalive.tick() => {
                if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return Err(ConnectError::Transient("keepalive write failed".into()));
                }
            }
        }
    }
}

/// One ingress frame from the relay: trust its `device_id`, make sure the
/// device has a pump, dispatch.
async fn handle_tunnel_text(
    state: &AppState,
    out_tx: &mpsc::Sender<Message>,
    pumps: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    text: &str,
) {
    let frame = match codec::decode_inbound(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("Tunnel: dropping undecodable frame: {e}");
            return;
        }
    };
    let Some(device_id) = frame.device_id.clone() else {
        warn!("Tunnel: frame without injected device_id, dropping");
        return;
    };

    let needs_pump = match pumps.get(&device_id) {
        Some(handle) => handle.is_finished(),
        None => true,
    };
    if needs_pump {
        state.devices.register(&device_id).await;
        let rx = state.router.register_device(&device_id).await;
        pumps.insert(
            device_id.clone(),
            tokio::spawn(device_pump(device_id.clone(), rx, out_tx.clone())),
        );
        info!("Tunnel: device {device_id} attached");
    }

    crate::ws::handle_frame(state, &device_id, frame).await;
}

/// Forward one device's router queue into the shared tunnel writer, tagging
/// each frame with its routing `device_id`. Exits when the device's sink is
/// dropped (overflow, idle sweep, or replacement).
async fn device_pump(
    device_id: String,
    mut rx: mpsc::Receiver<Outbound>,
    out_tx: mpsc::Sender<Message>,
) {
    while let Some(mut frame) = rx.recv().await {
        frame.device_id = Some(device_id.clone());
        match codec::encode_outbound(&frame) {
            Ok(text) => {
                if out_tx.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("Tunnel: encode for {device_id} failed: {e}"),
        }
    }
    debug!("Tunnel: device {device_id} pump ended");
}
