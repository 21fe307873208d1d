//! Per-purpose key derivation bound to a machine fingerprint.
//!
//! Keys are derived with HKDF-SHA256:
//!
//! ```text
//! ikm  = fingerprint || app_key
//! salt = SHA-256(fingerprint || "license_salt_v2")
//! info = "license_cache_" || purpose || "_v2"
//! ```
//!
//! Different purposes yield independent keys, so the encryption key and the
//! integrity key for the same cache never coincide.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Purpose label for the AEAD key.
pub const PURPOSE_ENCRYPTION: &str = "encryption";

/// Purpose label for the integrity (HMAC) key.
pub const PURPOSE_HMAC: &str = "hmac";

const SALT_SUFFIX: &[u8] = b"license_salt_v2";

/// Derives 256-bit keys from a fingerprint and an application key.
pub struct KeyDeriver {
    fingerprint: String,
    app_key: String,
}

impl KeyDeriver {
    /// Create a deriver for the given machine fingerprint and application key.
    #[must_use]
    pub fn new(fingerprint: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            app_key: app_key.into(),
        }
    }

    /// Derive the key for `purpose`.
    ///
    /// Never fails: if HKDF expansion is rejected, the key falls back to
    /// `SHA-256(fingerprint || app_key || purpose)`.
    #[must_use]
    pub fn derive(&self, purpose: &str) -> Zeroizing<[u8; 32]> {
        match self.try_derive(purpose) {
            Ok(key) => key,
            Err(_) => self.fallback(purpose),
        }
    }

    /// Derive the key for `purpose` without the fallback path.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if HKDF expansion fails.
    pub fn try_derive(&self, purpose: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let salt = Sha256::new()
            .chain_update(self.fingerprint.as_bytes())
            .chain_update(SALT_SUFFIX)
            .finalize();

        let mut ikm = Zeroizing::new(Vec::with_capacity(
            self.fingerprint.len() + self.app_key.len(),
        ));
        ikm.extend_from_slice(self.fingerprint.as_bytes());
        ikm.extend_from_slice(self.app_key.as_bytes());

        let info = format!("license_cache_{purpose}_v2");
        let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);

        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(info.as_bytes(), okm.as_mut())
            .map_err(|_| CryptoError::KeyDerivationFailed {
                purpose: purpose.to_string(),
            })?;
        Ok(okm)
    }

    fn fallback(&self, purpose: &str) -> Zeroizing<[u8; 32]> {
        let digest = Sha256::new()
            .chain_update(self.fingerprint.as_bytes())
            .chain_update(self.app_key.as_bytes())
            .chain_update(purpose.as_bytes())
            .finalize();
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        key
    }
}

impl std::fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
