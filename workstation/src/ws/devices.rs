//! Connected-device bookkeeping.
//!
//! One [`Device`] row per live client identity. Rows are created on first
//! contact, flip to authenticated after a valid `auth` frame, and are swept
//! once heartbeats stop for longer than the idle timeout.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::util::now_ms;

/// One connected client identity.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub authenticated: bool,
    /// Epoch milliseconds of the last heartbeat (or initial contact).
    pub last_heartbeat_at: u64,
    pub connected_at: u64,
}

/// Table of live devices. Cloneable — clones share the same inner map.
#[derive(Clone, Default)]
pub struct DeviceTracker {
    devices: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record first contact from a device. Idempotent; an existing row keeps
    /// its auth state.
    pub async fn register(&self, device_id: &str) {
        let mut devices = self.devices.write().await;
        let now = now_ms();
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device {
                device_id: device_id.to_string(),
                authenticated: false,
                last_heartbeat_at: now,
                connected_at: now,
            });
    }

    /// Flip the auth flag after key verification.
    pub async fn set_authenticated(&self, device_id: &str, authenticated: bool) {
        if let Some(d) = self.devices.write().await.get_mut(device_id) {
            d.authenticated = authenticated;
        }
    }

    pub async fn is_authenticated(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .await
            .get(device_id)
            .is_some_and(|d| d.authenticated)
    }

    /// Record a heartbeat.
    pub async fn touch(&self, device_id: &str) {
        if let Some(d) = self.devices.write().await.get_mut(device_id) {
            d.last_heartbeat_at = now_ms();
        }
    }

    pub async fn remove(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
    }

    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Remove devices whose last heartbeat is older than `idle_timeout_ms`.
    /// Returns the removed ids so the caller can drop their sinks.
    pub async fn sweep_idle(&self, idle_timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        let mut devices = self.devices.write().await;
        let expired: Vec<String> = devices
            .values()
            .filter(|d| now.saturating_sub(d.last_heartbeat_at) > idle_timeout_ms)
            .map(|d| d.device_id.clone())
            .collect();
        for id in &expired {
            devices.remove(id);
            info!("Device {id} idle-timed-out, removed");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_is_idempotent_and_keeps_auth() {
        let tracker = DeviceTracker::new();
        tracker.register("D1").await;
        tracker.set_authenticated("D1", true).await;
        tracker.register("D1").await;
        assert!(tracker.is_authenticated("D1").await);
        assert_eq!(tracker.count().await, 1);
    }

    #[tokio::test]
    async fn unknown_devices_are_not_authenticated() {
        let tracker = DeviceTracker::new();
        assert!(!tracker.is_authenticated("ghost").await);
    }

    #[tokio::test]
    async fn sweep_removes_only_idle_devices() {
        let tracker = DeviceTracker::new();
        tracker.register("fresh").await;
        tracker.register("stale").await;
        // Backdate the stale device's heartbeat.
        {
            let mut devices = tracker.devices.write().await;
            devices.get_mut("stale").unwrap().last_heartbeat_at = now_ms() - 10_000;
        }
        let removed = tracker.sweep_idle(5_000).await;
        assert_eq!(removed, vec!["stale"]);
        assert_eq!(tracker.count().await, 1);
    }
}
