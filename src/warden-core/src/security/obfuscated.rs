//! Obfuscated validation results and short-lived validation tokens.
//!
//! A valid result is not a `bool` but a 64-bit value derived from a
//! secret magic number:
//!
//! ```text
//! magic    = LE64( SHA-256(secret || "valid_magic_v1")[..8] )
//! value    = magic ^ nonce ^ (timestamp_ns & 0xFFFF_FFFF)      (valid)
//!          = random                                            (invalid)
//! checksum = LE32( HMAC(secret, LE64 value || LE64 ts || LE32 nonce)[..4] )
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use warden_crypto::{constant_time_eq, hmac_sha256};
use zeroize::Zeroizing;

use super::{random, unix_nanos};

/// Lifetime of an [`ObfuscatedResult`].
pub const RESULT_LIFETIME: Duration = Duration::from_secs(300);

/// A validation verdict that must be checked with the issuing validator.
#[derive(Clone, PartialEq, Eq)]
pub struct ObfuscatedResult {
    value: u64,
    timestamp: i64,
    nonce: u32,
    checksum: u32,
}

impl std::fmt::Debug for ObfuscatedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscatedResult").finish_non_exhaustive()
    }
}

/// HMAC token asserting a verdict until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationToken {
    /// Hex HMAC over `"<valid>:<expires_at>:<nonce>"`.
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
    /// Hex nonce.
    pub nonce: String,
}

/// Issues and checks [`ObfuscatedResult`]s and [`ValidationToken`]s.
pub struct ObfuscatedValidator {
    secret: Zeroizing<Vec<u8>>,
    valid_magic: u64,
}

impl ObfuscatedValidator {
    /// Validator keyed by `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let digest = Sha256::new()
            .chain_update(secret)
            .chain_update(b"valid_magic_v1")
            .finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self {
            secret: Zeroizing::new(secret.to_vec()),
            valid_magic: u64::from_le_bytes(head),
        }
    }

    /// Encode `valid` at the current time.
    pub fn create_result(&self, valid: bool) -> ObfuscatedResult {
        self.create_result_at(valid, unix_nanos())
    }

    /// Encode `valid` as of `now_ns`.
    pub fn create_result_at(&self, valid: bool, now_ns: i64) -> ObfuscatedResult {
        let nonce = random::u32();
        let value = if valid {
            self.expected_value(nonce, now_ns)
        } else {
            random::u64()
        };
        let mut result = ObfuscatedResult {
            value,
            timestamp: now_ns,
            nonce,
            checksum: 0,
        };
        result.checksum = self.checksum(&result);
        result
    }

    /// Whether `result` is intact, fresh and encodes "valid".
    pub fn verify_result(&self, result: &ObfuscatedResult) -> bool {
        self.verify_result_at(result, unix_nanos())
    }

    /// [`verify_result`](Self::verify_result) as of `now_ns`.
    pub fn verify_result_at(&self, result: &ObfuscatedResult, now_ns: i64) -> bool {
        if result.checksum != self.checksum(result) {
            return false;
        }
        let age = now_ns.saturating_sub(result.timestamp);
        if age > RESULT_LIFETIME.as_nanos() as i64 {
            return false;
        }
        result.value == self.expected_value(result.nonce, result.timestamp)
    }

    /// Token asserting `valid` for `ttl_secs`.
    pub fn create_token(&self, valid: bool, ttl_secs: i64) -> ValidationToken {
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
        let nonce = random::hex(16);
        let token = self.token_mac(valid, expires_at, &nonce);
        ValidationToken {
            token,
            expires_at,
            nonce,
        }
    }

    /// Whether `token` is unexpired and asserts `expected`.
    pub fn verify_token(&self, token: &ValidationToken, expected: bool) -> bool {
        if chrono::Utc::now().timestamp() > token.expires_at {
            return false;
        }
        let mac = self.token_mac(expected, token.expires_at, &token.nonce);
        !mac.is_empty() && constant_time_eq(mac.as_bytes(), token.token.as_bytes())
    }

    fn expected_value(&self, nonce: u32, timestamp: i64) -> u64 {
        self.valid_magic ^ u64::from(nonce) ^ (timestamp as u64 & 0xFFFF_FFFF)
    }

    fn checksum(&self, result: &ObfuscatedResult) -> u32 {
        let mac = hmac_sha256(
            &self.secret,
            &[
                &result.value.to_le_bytes(),
                &result.timestamp.to_le_bytes(),
                &result.nonce.to_le_bytes(),
            ],
        );
        match mac {
            Ok(mac) => u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]),
            Err(_) => !result.checksum,
        }
    }

    fn token_mac(&self, valid: bool, expires_at: i64, nonce: &str) -> String {
        let data = format!("{valid}:{expires_at}:{nonce}");
        hmac_sha256(&self.secret, &[data.as_bytes()])
            .map(hex::encode)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ObfuscatedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscatedValidator").finish_non_exhaustive()
    }
}
