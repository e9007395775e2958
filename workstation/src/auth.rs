//! Pre-shared auth-key checks.
//!
//! Clients authenticate with an `auth` frame after the transport opens; the
//! direct LAN WebSocket endpoint additionally validates a `?token=` query
//! parameter before the upgrade (browsers can't set headers on WebSocket
//! upgrades). All comparisons run in constant time.

/// Compare a presented key against the expected one without leaking where
/// (or whether) they diverge through timing.
///
/// The scan always covers every byte of the expected key. A presented key
/// that is too short is padded with the complement of the expected byte, so
/// the padding can never accidentally match; a length difference alone also
/// forces a mismatch.
pub fn verify_key(expected: &[u8], presented: &[u8]) -> bool {
    let mut mismatch = expected.len() ^ presented.len();
    for (position, &want) in expected.iter().enumerate() {
        let got = presented.get(position).copied().unwrap_or(!want);
        mismatch |= usize::from(want ^ got);
    }
    mismatch == 0
}
