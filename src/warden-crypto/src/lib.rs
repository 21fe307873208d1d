//! # warden-crypto
//!
//! Cryptographic primitives for the Warden license engine.
//!
//! This crate holds everything that touches key material:
//! - **Key derivation**: HKDF-SHA256 keys bound to a machine fingerprint
//!   and an application key, one key per purpose
//! - **Sealed blobs**: HMAC-SHA256 (encrypt-then-MAC) over AES-256-GCM
//! - **Server signatures**: RSA PKCS#1 v1.5 with SHA-256
//!
//! ## Sealed Blob Layout
//!
//! ```text
//! base64( HMAC[32] || nonce[12] || AES-256-GCM(plaintext) )
//! ```
//!
//! The HMAC is checked in constant time before decryption.
//!
//! Derived keys are returned in [`zeroize::Zeroizing`] wrappers so they are
//! wiped on drop.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub mod kdf;
pub mod signing;
pub mod sealed;

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub use error::CryptoError;
pub use kdf::{KeyDeriver, PURPOSE_ENCRYPTION, PURPOSE_HMAC};
pub use signing::{PayloadSigner, PayloadVerifier, RsaSigner, RsaVerifier};
pub use sealed::SealedBox;

/// Constant-time byte comparison.
///
/// Compares two byte slices in constant time to prevent timing attacks.
/// Returns `true` if the slices are equal, `false` otherwise.
///
/// # Security
///
/// This function MUST be used for all cryptographic comparisons
/// (MACs, checksums, tokens).
///
/// The length check still returns early; length is not secret for any
/// value compared in this workspace.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// HMAC-SHA256 over the concatenation of `parts`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPrivateKey`] if the MAC rejects the key.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::invalid_private_key(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}
