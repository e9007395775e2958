#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! # tiflisd
//!
//! The tiflis workstation daemon: owns the live session set (supervisor,
//! agents, terminals), routes typed protocol frames, fans streamed output
//! out to subscribed devices with per-session sequence numbers, and keeps
//! the durable message history.
//!
//! Key building blocks:
//! - `registry` — session lifecycle and the runtime seam
//! - `router` — subscription graph, sequence allocation, fan-out
//! - `store` — SQLite message log, terminal ring buffers, audio blobs
//! - `ws` — protocol dispatch plus the two transports (local WS, tunnel)
//! - `pumps` — background wiring between runtimes, registry, and router

pub mod auth;
pub mod config;
pub mod pumps;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod util;
pub mod ws;

pub use config::Config;
pub use registry::SessionRegistry;
pub use router::OutputRouter;
pub use state::AppState;
pub use store::MessageStore;
