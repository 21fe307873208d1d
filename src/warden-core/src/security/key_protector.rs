//! Fragmented, masked storage for the server public key.
//!
//! The PEM is cut into four fragments which are stored out of order and
//! XOR-masked with a machine-bound key. The key only exists whole while
//! [`PublicKeyProtector::public_key`] assembles it.

use std::sync::RwLock;

use sha2::{Digest, Sha256};
use warden_crypto::{constant_time_eq, hmac_sha256};
use zeroize::Zeroizing;

const FRAGMENTS: usize = 4;
/// Slot of fragment `i`.
const POSITIONS: [usize; FRAGMENTS] = [2, 0, 3, 1];

/// Holds the server public key split across masked fragments.
pub struct PublicKeyProtector {
    slots: RwLock<Option<[Vec<u8>; FRAGMENTS]>>,
    mask: Zeroizing<[u8; 16]>,
    integrity_key: Zeroizing<[u8; 16]>,
}

impl PublicKeyProtector {
    /// Protector bound to a machine fingerprint.
    pub fn new(fingerprint: &str) -> Self {
        let digest = Sha256::new()
            .chain_update(fingerprint.as_bytes())
            .chain_update(b"pubkey_protection_v1")
            .finalize();
        let mut mask = [0u8; 16];
        let mut integrity_key = [0u8; 16];
        mask.copy_from_slice(&digest[..16]);
        integrity_key.copy_from_slice(&digest[16..]);
        Self {
            slots: RwLock::new(None),
            mask: Zeroizing::new(mask),
            integrity_key: Zeroizing::new(integrity_key),
        }
    }

    /// Store `pem`, replacing any previous key.
    pub fn protect(&self, pem: &str) {
        let data = pem.as_bytes();
        let size = data.len().div_ceil(FRAGMENTS);
        let mut slots: [Vec<u8>; FRAGMENTS] = Default::default();
        for (i, &slot) in POSITIONS.iter().enumerate() {
            let start = (i * size).min(data.len());
            let end = (start + size).min(data.len());
            slots[slot] = self.apply_mask(&data[start..end]);
        }
        if let Ok(mut guard) = self.slots.write() {
            *guard = Some(slots);
        }
    }

    /// Whether a key has been stored.
    pub fn is_protected(&self) -> bool {
        self.slots.read().is_ok_and(|s| s.is_some())
    }

    /// Reassemble the PEM. Empty if nothing is stored.
    pub fn public_key(&self) -> Zeroizing<String> {
        let Ok(guard) = self.slots.read() else {
            return Zeroizing::new(String::new());
        };
        let Some(slots) = guard.as_ref() else {
            return Zeroizing::new(String::new());
        };
        let mut out = Zeroizing::new(Vec::new());
        for &slot in &POSITIONS {
            out.extend_from_slice(&self.apply_mask(&slots[slot]));
        }
        Zeroizing::new(String::from_utf8_lossy(&out).into_owned())
    }

    /// Hex HMAC of the stored key under the machine-bound integrity key.
    pub fn integrity_tag(&self) -> Option<String> {
        let pem = self.public_key();
        if pem.is_empty() {
            return None;
        }
        hmac_sha256(self.integrity_key.as_slice(), &[pem.as_bytes()])
            .ok()
            .map(hex::encode)
    }

    /// Whether the stored key matches `expected_tag`.
    pub fn verify_integrity(&self, expected_tag: &str) -> bool {
        self.integrity_tag()
            .is_some_and(|tag| constant_time_eq(tag.as_bytes(), expected_tag.as_bytes()))
    }

    fn apply_mask(&self, bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .zip(self.mask.iter().cycle())
            .map(|(b, m)| b ^ m)
            .collect()
    }
}

impl std::fmt::Debug for PublicKeyProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeyProtector")
            .field("protected", &self.is_protected())
            .finish_non_exhaustive()
    }
}
