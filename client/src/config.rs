//! Client configuration and the pairing deep link.
//!
//! Clients are embedded libraries, so configuration is built
//! programmatically — usually from a scanned pairing link
//! `tiflis://connect?data=<base64-json>` whose JSON carries
//! `{tunnel_id, url, key}`.

use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

/// Connection parameters for one workstation pairing.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL.
    pub url: String,
    /// Tunnel identity of the paired workstation.
    pub tunnel_id: String,
    /// Pre-shared auth key.
    pub auth_key: String,
    /// Process-stable device identity.
    pub device_id: String,
    /// Heartbeat emission interval (default 10 s); the ack deadline is
    /// twice this.
    pub heartbeat_interval: Duration,
    /// Reconnect backoff floor (default 500 ms).
    pub reconnect_min_delay: Duration,
    /// Reconnect backoff ceiling (default 4 s).
    pub reconnect_max_delay: Duration,
}

impl ClientConfig {
    pub fn new(
        url: impl Into<String>,
        tunnel_id: impl Into<String>,
        auth_key: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            tunnel_id: tunnel_id.into(),
            auth_key: auth_key.into(),
            device_id: device_id.into(),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_min_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(4),
        }
    }

    /// Build a config from a scanned pairing link.
    pub fn from_pairing_link(link: &str, device_id: impl Into<String>) -> Result<Self, String> {
        let pairing = PairingLink::parse(link)?;
        Ok(Self::new(
            pairing.url,
            pairing.tunnel_id,
            pairing.key,
            device_id,
        ))
    }
}

/// Decoded `tiflis://connect` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingLink {
    pub tunnel_id: String,
    pub url: String,
    pub key: String,
}

impl PairingLink {
    /// Parse `tiflis://connect?data=<base64-json>`.
    pub fn parse(link: &str) -> Result<Self, String> {
        let rest = link
            .strip_prefix("tiflis://connect?")
            .ok_or_else(|| "not a tiflis://connect link".to_string())?;
        let data = rest
            .split('&')
            .find_map(|pair| pair.strip_prefix("data="))
            .ok_or_else(|| "missing data parameter".to_string())?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| format!("invalid base64: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid pairing payload: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(json: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    #[test]
    fn pairing_link_round_trips() {
        let data = encode(r#"{"tunnel_id":"t-1","url":"wss://relay.example.com/tunnel","key":"K"}"#);
        let link = format!("tiflis://connect?data={data}");
        let config = ClientConfig::from_pairing_link(&link, "D1").unwrap();
        assert_eq!(config.tunnel_id, "t-1");
        assert_eq!(config.url, "wss://relay.example.com/tunnel");
        assert_eq!(config.auth_key, "K");
        assert_eq!(config.device_id, "D1");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        assert!(PairingLink::parse("https://connect?data=x").is_err());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let link = format!("tiflis://connect?data={}", encode(r#"{"nope":1}"#));
        assert!(PairingLink::parse(&link).is_err());
    }
}
