#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tiflisd
//!
//! Workstation daemon for the tiflis remote-control system. Serves the
//! device protocol over a direct LAN WebSocket and, when configured, an
//! outbound tunnel connection, so phones, watches, and browsers can drive
//! agent sessions and terminals from anywhere.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tiflisd::registry::runtime::EchoRuntime;
use tiflisd::registry::{CreateSessionSpec, SessionRegistry};
use tiflisd::router::OutputRouter;
use tiflisd::store::{AudioStore, MessageStore, RingStore};
use tiflisd::ws::devices::DeviceTracker;
use tiflisd::{pumps, ws, AppState, Config};

use tiflis_protocol::SessionKind;

/// tiflis workstation daemon.
#[derive(Parser)]
#[command(name = "tiflisd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workstation daemon (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("tiflisd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Workstation name: {}", config.server.name);
    info!("Listening on {}", config.server.listen);

    if config.auth.auth_key == "change-me" {
        warn!("Using default auth key — set TIFLISD_AUTH_KEY or update config");
    }

    let data_dir = Path::new(&config.server.data_dir);
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        tracing::error!("Cannot create data dir {}: {e}", data_dir.display());
        std::process::exit(1);
    }
    let store = match MessageStore::open(&data_dir.join("tiflisd.db")) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Cannot open message store: {e}");
            std::process::exit(1);
        }
    };
    let audio = Arc::new(AudioStore::new(data_dir));

    let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
    let runtime = Arc::new(EchoRuntime::new(runtime_tx));
    let config = Arc::new(config);
    let registry = SessionRegistry::new(&config, runtime);
    let router = OutputRouter::new(
        Arc::clone(&store),
        RingStore::new(config.server.terminal_buffer_size),
        registry.clone(),
        config.server.fanout_queue_size,
        config.server.history_page_size,
        config.workspace_tree(),
    );

    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        registry: registry.clone(),
        router,
        store,
        audio,
        devices: DeviceTracker::new(),
    };

    // The supervisor exists from boot; creation is idempotent anyway.
    match registry
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

    tokio::spawn(pumps::run_runtime_pump(state.clone(), runtime_rx));
    tokio::spawn(pumps::run_registry_pump(
        state.clone(),
        registry.subscribe_events(),
    ));
    tokio::spawn(pumps::run_device_sweep(state.clone()));

    if let Some(tunnel_config) = config.tunnel.clone() {
        info!("Tunnel enabled: {}", tunnel_config.url);
        ws::tunnel::spawn(state.clone(), tunnel_config);
    }

    let app = Router::new()
        .route("/ws", get(ws::local::ws_upgrade))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Cannot bind {}: {e}", config.server.listen);
            std::process::exit(1);
        }
    };

    let shutdown_state = state.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down, terminating sessions");
        shutdown_state.registry.terminate_all().await;
    });

    if let Err(e) = server.await {
        tracing::error!("Server error: {e}");
    }
}
