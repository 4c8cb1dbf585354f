//! Target/difficulty codec.
//!
//! Pools describe a job's difficulty with either a 4-byte compact target or
//! a 32-byte full target. Both are converted here to an exact 256-bit
//! threshold; a hash is a valid share iff its numeric value (little-endian)
//! is less than or equal to the threshold. The comparison must be exact —
//! keeping only the low 64 or 128 bits of the hash silently accepts shares
//! that a real pool would reject and rejects some that it would accept.

use uint::construct_uint;

use crate::error::{MinerError, Result};

construct_uint! {
    pub struct U256(4);
}

/// `2**256 - 1`, the maximum value representable by [`U256`].
fn u256_max() -> U256 {
    U256::max_value()
}

/// A decoded 256-bit comparison target plus the display-only difficulty
/// it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub target_256: U256,
    pub difficulty: u64,
}

impl Target {
    /// Decode a pool-supplied target hex string. Accepts the 4-byte compact
    /// form (8 hex chars) or the 32-byte full form (64 hex chars).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| MinerError::ProtocolMalformed(format!("bad target hex: {e}")))?;
        match bytes.len() {
            4 => {
                let compact = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(Self::from_compact(compact))
            }
            32 => Ok(Self::from_full_bytes(&bytes)),
            n => Err(MinerError::ProtocolMalformed(format!(
                "target must be 4 or 32 bytes, got {n}"
            ))),
        }
    }

    /// Decode the 4-byte compact target encoding.
    pub fn from_compact(compact: u32) -> Self {
        let c = if compact == 0 { 1 } else { compact as u64 };
        let difficulty = (1u64 << 32).saturating_div(c).max(1);
        let target_256 = u256_max() / U256::from(difficulty);
        Self {
            target_256,
            difficulty,
        }
    }

    /// Decode the 32-byte full target encoding (little-endian).
    pub fn from_full_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), 32);
        let target_256 = U256::from_little_endian(bytes);
        let low64 = target_256.low_u64().max(1);
        let difficulty = u64::MAX.saturating_div(low64).max(1);
        Self {
            target_256,
            difficulty,
        }
    }

    /// True iff `hash` (interpreted as a little-endian 256-bit integer) is a
    /// valid share against this target, i.e. `hash <= target_256`.
    ///
    /// An all-zero hash is rejected unconditionally: it is numerically the
    /// smallest possible value and would otherwise always pass, which is the
    /// signature of an uninitialised or malfunctioning VM rather than a
    /// genuine share.
    pub fn is_valid_hash(&self, hash: &[u8; 32]) -> bool {
        if hash.iter().all(|&b| b == 0) {
            return false;
        }
        let value = U256::from_little_endian(hash);
        value <= self.target_256
    }
}

trait SaturatingDiv {
    fn saturating_div(self, rhs: Self) -> Self;
}

impl SaturatingDiv for u64 {
    fn saturating_div(self, rhs: Self) -> Self {
        if rhs == 0 {
            self
        } else {
            self / rhs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_target_f3220000() {
        // "f3220000" little-endian bytes -> u32 0x000022f3
        let bytes = hex::decode("f3220000").unwrap();
        let compact = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(compact, 0x0000_22f3);
        let t = Target::from_compact(compact);
        assert!(t.difficulty > 479_000 && t.difficulty < 481_000, "{}", t.difficulty);
        // most-significant 64 bits of target_256 must be small (target is close to 2^256/difficulty)
        assert!((t.target_256 >> 192) < U256::from(1u64 << 56));
    }

    #[test]
    fn compact_roundtrip_values() {
        for compact in [0x0000_00ffu32, 0x0000_ffff, 0x00ff_ffff] {
            let t = Target::from_compact(compact);
            assert!(t.difficulty > 0);
            assert!(t.target_256 <= u256_max());
        }
    }

    #[test]
    fn low_hash_is_valid_share() {
        let t = Target::from_hex("f3220000").unwrap();
        let mut hash = [0u8; 32];
        hash[0] = 1;
        assert!(t.is_valid_hash(&hash));
    }

    #[test]
    fn all_zero_hash_rejected() {
        let t = Target::from_hex("f3220000").unwrap();
        let hash = [0u8; 32];
        assert!(!t.is_valid_hash(&hash));
    }

    #[test]
    fn full_target_parses_32_bytes() {
        let mut bytes = [0xffu8; 32];
        bytes[31] = 0x00;
        let hex_str = hex::encode(bytes);
        let t = Target::from_hex(&hex_str).unwrap();
        assert!(t.difficulty >= 1);
    }

    #[test]
    fn exact_arithmetic_not_truncated_to_64_bits() {
        // A very small compact value yields a difficulty that does not fit
        // meaningfully if the target were derived from a 64-bit-only division.
        let t = Target::from_compact(1);
        // target should be close to u256 max, definitely using the high bits.
        assert!((t.target_256 >> 192) > U256::zero());
    }
}
