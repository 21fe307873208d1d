//! Server challenge-response.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use warden_crypto::hmac_sha256;
use zeroize::Zeroizing;

use super::random;
use crate::error::LicenseError;

/// Upper bound on hash-prefix search iterations.
pub const MAX_PREFIX_ITERATIONS: u64 = 10_000_000;

/// Challenge issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Challenge identifier, echoed in the answer.
    pub challenge_id: String,
    /// Challenge string.
    pub challenge: String,
    /// `hmac-sha256` or `hash-prefix`; anything else is treated as HMAC.
    #[serde(default)]
    pub algorithm: String,
    /// Leading hex zeros required by `hash-prefix`.
    #[serde(default)]
    pub difficulty: usize,
    /// Unix seconds.
    pub expires_at: i64,
}

/// Answer to a [`Challenge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeAnswer {
    /// Identifier copied from the challenge.
    pub challenge_id: String,
    /// Solution; empty if a `hash-prefix` search gave up.
    pub answer: String,
    /// 16-byte hex nonce.
    pub nonce: String,
    /// Unix seconds at solve time.
    pub timestamp: i64,
}

/// Solves [`Challenge`]s with a client secret.
pub struct ChallengeSolver {
    secret: Zeroizing<Vec<u8>>,
}

impl ChallengeSolver {
    /// Solver keyed by `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    /// Solve `challenge`.
    ///
    /// # Errors
    ///
    /// [`LicenseError::ChallengeExpired`] if `expires_at` has passed.
    pub fn solve(&self, challenge: &Challenge) -> Result<ChallengeAnswer, LicenseError> {
        let now = chrono::Utc::now().timestamp();
        if now > challenge.expires_at {
            return Err(LicenseError::ChallengeExpired);
        }
        let nonce = random::hex(16);
        let answer = match challenge.algorithm.as_str() {
            "hash-prefix" => solve_hash_prefix(&challenge.challenge, challenge.difficulty),
            _ => self.solve_hmac(&challenge.challenge, &nonce)?,
        };
        Ok(ChallengeAnswer {
            challenge_id: challenge.challenge_id.clone(),
            answer,
            nonce,
            timestamp: now,
        })
    }

    fn solve_hmac(&self, challenge: &str, nonce: &str) -> Result<String, LicenseError> {
        let data = format!("{challenge}:{nonce}");
        Ok(hex::encode(hmac_sha256(&self.secret, &[data.as_bytes()])?))
    }
}

impl std::fmt::Debug for ChallengeSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeSolver").finish_non_exhaustive()
    }
}

/// Smallest `n` such that `hex(SHA-256("<challenge>:<n>"))` starts with
/// `difficulty` zeros, or an empty string after [`MAX_PREFIX_ITERATIONS`].
pub fn solve_hash_prefix(challenge: &str, difficulty: usize) -> String {
    if difficulty > 64 {
        return String::new();
    }
    let prefix = "0".repeat(difficulty);
    for n in 0..=MAX_PREFIX_ITERATIONS {
        let digest = Sha256::digest(format!("{challenge}:{n}").as_bytes());
        if hex::encode(digest).starts_with(&prefix) {
            return n.to_string();
        }
    }
    String::new()
}
