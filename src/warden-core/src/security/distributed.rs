//! Distributed validation results.
//!
//! One verdict is spread over [`TOKEN_COUNT`] independent tokens so that
//! callers can check different tokens at different points of a critical
//! path. Patching a single comparison leaves the other tokens failing.
//!
//! ```text
//! secret   = SHA-256(fingerprint || app_key || "distributed_validation_v2")
//! magic[i] = LE64( SHA-256(secret || i)[..8] )
//! token[i] = magic[i] ^ nonce ^ ((ts >> 8i) & 0xFF)       (valid; random otherwise)
//! valid[i] = 0x5A5A5A5A ^ (nonce >> 8i) as u32            (valid; random otherwise)
//! checksum = LE64( HMAC(secret, tokens/valid, ts, nonce, seq)[..8] )
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use warden_crypto::hmac_sha256;
use zeroize::Zeroizing;

use super::{random, unix_nanos};

/// Tokens per result.
pub const TOKEN_COUNT: usize = 4;

/// Lifetime of a [`DistributedResult`].
pub const RESULT_LIFETIME: Duration = Duration::from_secs(600);

const VALID_PATTERN: u32 = 0x5A5A_5A5A;

/// A verdict split across several tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct DistributedResult {
    tokens: [u64; TOKEN_COUNT],
    valid: [u32; TOKEN_COUNT],
    timestamp: i64,
    nonce: u64,
    sequence: u32,
    checksum: u64,
}

impl DistributedResult {
    /// Issue sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl std::fmt::Debug for DistributedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedResult")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Issues and checks [`DistributedResult`]s.
pub struct DistributedValidator {
    secret: Zeroizing<[u8; 32]>,
    magic: [u64; TOKEN_COUNT],
    counter: AtomicU64,
}

impl DistributedValidator {
    /// Validator bound to a machine and an application.
    pub fn new(fingerprint: &str, app_key: &str) -> Self {
        let secret: [u8; 32] = Sha256::new()
            .chain_update(fingerprint.as_bytes())
            .chain_update(app_key.as_bytes())
            .chain_update(b"distributed_validation_v2")
            .finalize()
            .into();

        let mut magic = [0u64; TOKEN_COUNT];
        for (i, slot) in magic.iter_mut().enumerate() {
            let digest = Sha256::new()
                .chain_update(secret)
                .chain_update([i as u8])
                .finalize();
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            *slot = u64::from_le_bytes(head);
        }

        Self {
            secret: Zeroizing::new(secret),
            magic,
            counter: AtomicU64::new(0),
        }
    }

    /// Encode `valid` at the current time.
    pub fn create_result(&self, valid: bool) -> DistributedResult {
        self.create_result_at(valid, unix_nanos())
    }

    /// Encode `valid` as of `now_ns`.
    pub fn create_result_at(&self, valid: bool, now_ns: i64) -> DistributedResult {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as u32;
        let nonce = random::u64();
        let mut result = DistributedResult {
            tokens: [0; TOKEN_COUNT],
            valid: [0; TOKEN_COUNT],
            timestamp: now_ns,
            nonce,
            sequence,
            checksum: 0,
        };
        for i in 0..TOKEN_COUNT {
            if valid {
                result.tokens[i] = self.expected_token(i, nonce, now_ns);
                result.valid[i] = expected_flag(i, nonce);
            } else {
                result.tokens[i] = random::u64();
                result.valid[i] = random::u32();
            }
        }
        result.checksum = self.checksum(&result);
        result
    }

    /// Check token `index` of `result`.
    pub fn verify_token(&self, result: &DistributedResult, index: usize) -> bool {
        self.verify_token_at(result, index, unix_nanos())
    }

    /// [`verify_token`](Self::verify_token) as of `now_ns`.
    pub fn verify_token_at(&self, result: &DistributedResult, index: usize, now_ns: i64) -> bool {
        if index >= TOKEN_COUNT {
            return false;
        }
        if result.checksum != self.checksum(result) {
            return false;
        }
        if now_ns.saturating_sub(result.timestamp) > RESULT_LIFETIME.as_nanos() as i64 {
            return false;
        }
        result.tokens[index] == self.expected_token(index, result.nonce, result.timestamp)
            && result.valid[index] == expected_flag(index, result.nonce)
    }

    /// Check every token.
    pub fn verify_all(&self, result: &DistributedResult) -> bool {
        let now = unix_nanos();
        (0..TOKEN_COUNT).all(|i| self.verify_token_at(result, i, now))
    }

    fn expected_token(&self, index: usize, nonce: u64, timestamp: i64) -> u64 {
        self.magic[index] ^ nonce ^ ((timestamp >> (index * 8)) as u64 & 0xFF)
    }

    fn checksum(&self, result: &DistributedResult) -> u64 {
        let mut data = Vec::with_capacity(TOKEN_COUNT * 12 + 20);
        for i in 0..TOKEN_COUNT {
            data.extend_from_slice(&result.tokens[i].to_le_bytes());
            data.extend_from_slice(&result.valid[i].to_le_bytes());
        }
        data.extend_from_slice(&result.timestamp.to_le_bytes());
        data.extend_from_slice(&result.nonce.to_le_bytes());
        data.extend_from_slice(&result.sequence.to_le_bytes());

        match hmac_sha256(self.secret.as_slice(), &[&data]) {
            Ok(mac) => {
                let mut head = [0u8; 8];
                head.copy_from_slice(&mac[..8]);
                u64::from_le_bytes(head)
            },
            Err(_) => !result.checksum,
        }
    }
}

fn expected_flag(index: usize, nonce: u64) -> u32 {
    VALID_PATTERN ^ (nonce >> (index * 8)) as u32
}

impl std::fmt::Debug for DistributedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedValidator").finish_non_exhaustive()
    }
}
