//! Error types for license operations.

use thiserror::Error;

/// Errors that can occur during license operations.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Server certificate did not match the pinned fingerprint.
    #[error("Certificate pinning mismatch: expected {expected}, got {actual}")]
    CertificatePinningMismatch {
        /// Normalized pinned fingerprint.
        expected: String,
        /// Normalized fingerprint presented by the server.
        actual: String,
    },

    /// Server signature did not verify.
    #[error("Signature verification failed: {reason}")]
    SignatureVerificationFailed {
        /// Reason for failure.
        reason: String,
    },

    /// A signature was required but the payload carried none.
    #[error("Response signature missing")]
    SignatureMissing,

    /// Signed payload timestamp is outside the replay window.
    #[error("Signature expired: timestamp {timestamp} outside {window_secs}s window")]
    SignatureExpired {
        /// Timestamp carried by the payload.
        timestamp: i64,
        /// Accepted window in seconds.
        window_secs: u64,
    },

    /// Public key missing or malformed.
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Local cache failed its integrity check.
    #[error("Cache integrity check failed")]
    CacheIntegrityFailure,

    /// Local cache is older than the maximum age.
    #[error("Cache expired")]
    CacheExpired,

    /// Cache read/write error.
    #[error("Cache error: {message}")]
    Cache {
        /// Error message.
        message: String,
    },

    /// Could not reach the license server.
    #[error("Network failure: {message}")]
    NetworkFailure {
        /// Error message.
        message: String,
    },

    /// Server answered with a non-zero envelope code.
    #[error("API error {code}: {message}")]
    Api {
        /// Envelope code.
        code: i64,
        /// Envelope message.
        message: String,
    },

    /// Server answered with something that is not a valid envelope.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Error message.
        message: String,
    },

    /// Challenge was presented after its expiry.
    #[error("Challenge expired")]
    ChallengeExpired,

    /// Operation refused because the installation is not authorized.
    #[error("Not authorized")]
    NotAuthorized,

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] warden_crypto::CryptoError),
}

impl LicenseError {
    /// Create a signature verification error.
    #[must_use]
    pub fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureVerificationFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid public key error.
    #[must_use]
    pub fn public_key(reason: impl Into<String>) -> Self {
        Self::InvalidPublicKey {
            reason: reason.into(),
        }
    }

    /// Create a cache error.
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure {
            message: message.into(),
        }
    }

    /// Create an invalid response error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a local cache failure (silently recovered).
    #[must_use]
    pub fn is_cache_failure(&self) -> bool {
        matches!(
            self,
            Self::CacheIntegrityFailure | Self::CacheExpired | Self::Cache { .. }
        )
    }

    /// Check if this is a server signature failure.
    #[must_use]
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureVerificationFailed { .. }
                | Self::SignatureMissing
                | Self::SignatureExpired { .. }
                | Self::InvalidPublicKey { .. }
        )
    }

    /// Check if the operation may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure { .. })
    }
}
