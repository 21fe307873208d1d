//! Tamper-evident boolean.
//!
//! The value is stored twice, once as a pattern and once as its
//! complement, both masked with a fresh nonce on every write. A checksum
//! ties the three words together. A single flipped word reads as `false`.

use super::random;

const TRUE_PATTERN: u32 = 0x5A5A_5A5A;
const FALSE_PATTERN: u32 = 0xA5A5_A5A5;
const CHECKSUM_SEED: u32 = 0xDEAD_BEEF;

/// Boolean stored redundantly with an integrity checksum.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtectedBool {
    primary: u32,
    mirror: u32,
    nonce: u32,
    checksum: u32,
}

impl ProtectedBool {
    /// Store `value`.
    pub fn new(value: bool) -> Self {
        let mut pb = Self {
            primary: 0,
            mirror: 0,
            nonce: 0,
            checksum: 0,
        };
        pb.set(value);
        pb
    }

    /// Overwrite with `value` under a fresh nonce.
    pub fn set(&mut self, value: bool) {
        self.nonce = random::u32();
        let (primary, mirror) = if value {
            (TRUE_PATTERN, FALSE_PATTERN)
        } else {
            (FALSE_PATTERN, TRUE_PATTERN)
        };
        self.primary = primary ^ self.nonce;
        self.mirror = mirror ^ self.nonce;
        self.checksum = self.expected_checksum();
    }

    /// Stored value; `false` if the storage is not intact.
    pub fn get(&self) -> bool {
        self.is_intact() && self.primary ^ self.nonce == TRUE_PATTERN
    }

    /// Whether checksum and mirror are consistent.
    pub fn is_intact(&self) -> bool {
        self.checksum == self.expected_checksum()
            && (self.primary ^ self.nonce) ^ (self.mirror ^ self.nonce) == u32::MAX
    }

    fn expected_checksum(&self) -> u32 {
        self.primary ^ self.mirror ^ self.nonce ^ CHECKSUM_SEED
    }
}

impl Default for ProtectedBool {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for ProtectedBool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedBool")
            .field("intact", &self.is_intact())
            .finish_non_exhaustive()
    }
}
