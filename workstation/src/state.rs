//! Shared application state passed to every handler.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::router::OutputRouter;
use crate::store::{AudioStore, MessageStore};
use crate::ws::devices::DeviceTracker;

/// Shared state for the tiflisd server. Cloneable — all clones share the
/// same inner handles.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime reporting).
    pub start_time: Instant,
    /// Session lifecycle authority.
    pub registry: SessionRegistry,
    /// Subscription graph, sequence allocation, and fan-out.
    pub router: OutputRouter,
    /// Durable message log.
    pub store: Arc<MessageStore>,
    /// Voice blob store.
    pub audio: Arc<AudioStore>,
    /// Connected-device table.
    pub devices: DeviceTracker,
}

impl AppState {
    /// Milliseconds since the server started.
    pub fn uptime_ms(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.start_time.elapsed().as_millis() as u64
        }
    }
}
