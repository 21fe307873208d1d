//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid signature encoding or length.
    #[error("Invalid signature: {reason}")]
    InvalidSignature {
        /// Reason the signature is invalid.
        reason: String,
    },

    /// Signature verification failed.
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Invalid public key format.
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Invalid private key format.
    #[error("Invalid private key: {reason}")]
    InvalidPrivateKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Key generation failed.
    #[error("Key generation failed: {reason}")]
    KeyGenerationFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Signing operation failed.
    #[error("Signing failed: {reason}")]
    SigningFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Key derivation failed.
    #[error("Key derivation failed for purpose '{purpose}'")]
    KeyDerivationFailed {
        /// The purpose label that was being derived.
        purpose: String,
    },

    /// A sealed blob is malformed (bad encoding or too short).
    #[error("Malformed sealed blob: {reason}")]
    MalformedBlob {
        /// Reason the blob was rejected.
        reason: String,
    },

    /// The integrity tag on a sealed blob did not match.
    #[error("Integrity tag mismatch")]
    IntegrityMismatch,

    /// AEAD encryption failed.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (wrong key or corrupted ciphertext).
    #[error("Decryption failed")]
    DecryptionFailed,
}

impl CryptoError {
    /// Create an invalid signature error.
    #[must_use]
    pub fn invalid_signature(reason: impl Into<String>) -> Self {
        Self::InvalidSignature {
            reason: reason.into(),
        }
    }

    /// Create an invalid public key error.
    #[must_use]
    pub fn invalid_public_key(reason: impl Into<String>) -> Self {
        Self::InvalidPublicKey {
            reason: reason.into(),
        }
    }

    /// Create an invalid private key error.
    #[must_use]
    pub fn invalid_private_key(reason: impl Into<String>) -> Self {
        Self::InvalidPrivateKey {
            reason: reason.into(),
        }
    }

    /// Create a signing failed error.
    #[must_use]
    pub fn signing_failed(reason: impl Into<String>) -> Self {
        Self::SigningFailed {
            reason: reason.into(),
        }
    }

    /// Create a key generation failed error.
    #[must_use]
    pub fn key_generation_failed(reason: impl Into<String>) -> Self {
        Self::KeyGenerationFailed {
            reason: reason.into(),
        }
    }

    /// Create a malformed blob error.
    #[must_use]
    pub fn malformed_blob(reason: impl Into<String>) -> Self {
        Self::MalformedBlob {
            reason: reason.into(),
        }
    }

    /// Whether this error indicates tampered or corrupted sealed data.
    #[must_use]
    pub fn is_tamper(&self) -> bool {
        matches!(
            self,
            Self::IntegrityMismatch | Self::DecryptionFailed | Self::MalformedBlob { .. }
        )
    }
}
