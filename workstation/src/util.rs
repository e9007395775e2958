//! Small shared helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// 8-character lowercase hex nonce used in session ids.
pub fn nonce8() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_eight_hex_chars() {
        let n = nonce8();
        assert_eq!(n.len(), 8);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(nonce8(), nonce8());
    }

    #[test]
    fn tilde_expansion_leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde("/tmp/x"), "/tmp/x");
    }
}
