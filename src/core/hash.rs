//! Checksums and Digests
//!
//! Two hash families live here:
//! - FNV-1a 64-bit, folded incrementally by the bit stream in checksum mode
//!   and used for frame checksums and event content keys.
//! - SHA-256 with a domain separator, used for configuration digests that
//!   peers exchange before simulating.

use sha2::{Digest, Sha256};

/// FNV-1a 64-bit offset basis.
pub const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Domain separator for runtime configuration digests.
pub const CONFIG_DOMAIN: &[u8] = b"LOCKSTEP_CONFIG_V1";

/// 256-bit digest output.
pub type Digest256 = [u8; 32];

// =============================================================================
// CHECKSUM ACCUMULATOR
// =============================================================================

/// Running 64-bit FNV-1a accumulator.
///
/// Order of updates is significant: the same values folded in a different
/// order produce a different checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumAccumulator {
    state: u64,
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumAccumulator {
    /// Fresh accumulator seeded with the offset basis.
    #[inline]
    pub const fn new() -> Self {
        Self { state: FNV_OFFSET_BASIS }
    }

    /// Fold raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= b as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    /// Fold a u8.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.update_bytes(&[value]);
    }

    /// Fold a u32 (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.update_bytes(&value.to_le_bytes());
    }

    /// Fold an i32 (little-endian).
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.update_bytes(&value.to_le_bytes());
    }

    /// Fold a u64 (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.update_bytes(&value.to_le_bytes());
    }

    /// Current accumulated value.
    #[inline]
    pub fn finish(&self) -> u64 {
        self.state
    }

    /// Reset to the offset basis.
    #[inline]
    pub fn reset(&mut self) {
        self.state = FNV_OFFSET_BASIS;
    }
}

/// One-shot FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut acc = ChecksumAccumulator::new();
    acc.update_bytes(bytes);
    acc.finish()
}

// =============================================================================
// DIGESTS
// =============================================================================

/// SHA-256 with a domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Digest256 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest of an encoded configuration blob.
pub fn config_digest(encoded: &[u8]) -> Digest256 {
    hash_with_domain(CONFIG_DOMAIN, encoded)
}

/// Short hex rendering of a checksum for log lines.
pub fn checksum_hex(checksum: u64) -> String {
    hex::encode(checksum.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_known_values() {
        assert_eq!(fnv1a(b""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a(b"abc"), 16654208175385433931);
    }

    #[test]
    fn test_accumulator_is_incremental() {
        let mut acc = ChecksumAccumulator::new();
        acc.update_bytes(b"ab");
        acc.update_bytes(b"c");
        assert_eq!(acc.finish(), fnv1a(b"abc"));

        acc.reset();
        assert_eq!(acc.finish(), FNV_OFFSET_BASIS);
    }

    #[test]
    fn test_accumulator_order_matters() {
        let mut a = ChecksumAccumulator::new();
        a.update_u32(1);
        a.update_u32(2);

        let mut b = ChecksumAccumulator::new();
        b.update_u32(2);
        b.update_u32(1);

        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_domain_separation() {
        let data = b"same data";
        assert_ne!(hash_with_domain(b"A", data), hash_with_domain(b"B", data));
        assert_eq!(config_digest(data), hash_with_domain(CONFIG_DOMAIN, data));
    }

    #[test]
    fn test_checksum_hex() {
        assert_eq!(checksum_hex(0x0102), "0000000000000102");
    }
}
