//! Snapshot Digests
//!
//! SHA-256 digests of whole-world state, used to compare peers and replays
//! in logs. Never part of the wire format.

use sha2::{Digest, Sha256};

/// Digest output (32 bytes).
pub type StateHash = [u8; 32];

/// Incremental hasher with a domain separator.
///
/// Update order is significant.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a hasher with a domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for a full world digest.
    pub fn for_world() -> Self {
        Self::new(b"KART_REWIND_WORLD_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u8.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an f32 bit pattern.
    #[inline]
    pub fn update_f32(&mut self, value: f32) {
        self.update_u32(value.to_bits());
    }

    /// Update with a length-prefixed string.
    pub fn update_str(&mut self, s: &str) {
        self.update_u32(s.len() as u32);
        self.hasher.update(s.as_bytes());
    }

    /// Finalize.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Digest of the world at `tick`.
///
/// The closure adds world-specific data in a fixed order.
pub fn compute_world_hash<F>(tick: u32, add_state: F) -> StateHash
where
    F: FnOnce(&mut StateHasher),
{
    let mut hasher = StateHasher::for_world();
    hasher.update_u32(tick);
    add_state(&mut hasher);
    hasher.finalize()
}

/// First 8 bytes as hex, for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_determinism() {
        let make = || {
            let mut h = StateHasher::for_world();
            h.update_u32(100);
            h.update_f32(1.5);
            h.update_u8(7);
            h.update_str("K0");
            h.finalize()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_hash_order_matters() {
        let a = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(1);
            h.update_u32(2);
            h.finalize()
        };
        let b = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(2);
            h.update_u32(1);
            h.finalize()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_signed_zero_changes_hash() {
        let a = compute_world_hash(1, |h| h.update_f32(0.0));
        let b = compute_world_hash(1, |h| h.update_f32(-0.0));
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_hex() {
        let hash = [0xABu8; 32];
        assert_eq!(short_hex(&hash), "abababababababab");
    }
}
