//! Authenticated sealed blobs.
//!
//! Layout of a sealed blob:
//!
//! ```text
//! tag[32] || nonce[12] || AES-256-GCM(ciphertext + gcm_tag)
//! tag = HMAC-SHA256(mac_key, nonce || ciphertext)
//! ```
//!
//! The outer HMAC is checked in constant time before any decryption is
//! attempted, so a corrupted blob never reaches the AEAD.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::{KeyDeriver, PURPOSE_ENCRYPTION, PURPOSE_HMAC};
use crate::{constant_time_eq, hmac_sha256};

/// HMAC tag length in bytes.
pub const TAG_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Seals and opens blobs under an (encryption key, integrity key) pair.
pub struct SealedBox {
    enc_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl SealedBox {
    /// Create a box from explicit keys.
    #[must_use]
    pub fn new(enc_key: Zeroizing<[u8; 32]>, mac_key: Zeroizing<[u8; 32]>) -> Self {
        Self { enc_key, mac_key }
    }

    /// Create a box with keys derived for the `encryption` and `hmac` purposes.
    #[must_use]
    pub fn from_deriver(deriver: &KeyDeriver) -> Self {
        Self::new(
            deriver.derive(PURPOSE_ENCRYPTION),
            deriver.derive(PURPOSE_HMAC),
        )
    }

    /// Seal `plaintext` with a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.seal_with_nonce(plaintext, nonce)
    }

    fn seal_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: [u8; NONCE_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.enc_key.as_ref()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let tag = hmac_sha256(self.mac_key.as_ref(), &[&nonce, &ciphertext])?;

        let mut out = Vec::with_capacity(TAG_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Verify and decrypt a sealed blob.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::MalformedBlob`] if the blob is shorter than tag + nonce
    /// - [`CryptoError::IntegrityMismatch`] if the HMAC tag does not match
    /// - [`CryptoError::DecryptionFailed`] if the AEAD rejects the ciphertext
    pub fn open(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if blob.len() < TAG_LEN + NONCE_LEN {
            return Err(CryptoError::malformed_blob(format!(
                "{} bytes, need at least {}",
                blob.len(),
                TAG_LEN + NONCE_LEN
            )));
        }

        let (tag, rest) = blob.split_at(TAG_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let expected = hmac_sha256(self.mac_key.as_ref(), &[nonce, ciphertext])?;
        if !constant_time_eq(tag, &expected) {
            return Err(CryptoError::IntegrityMismatch);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.enc_key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Seal and encode as standard base64.
    ///
    /// # Errors
    ///
    /// See [`SealedBox::seal`].
    pub fn seal_base64(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.seal(plaintext).map(|blob| BASE64.encode(blob))
    }

    /// Decode standard base64 and open.
    ///
    /// # Errors
    ///
    /// [`CryptoError::MalformedBlob`] on bad base64, otherwise see [`SealedBox::open`].
    pub fn open_base64(&self, encoded: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let blob = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::malformed_blob(e.to_string()))?;
        self.open(&blob)
    }
}

impl std::fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedBox { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_box() -> SealedBox {
        SealedBox::from_deriver(&KeyDeriver::new("fingerprint", "app"))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let sb = sealed_box();
        let blob = sb.seal(b"hello license").unwrap();
        assert_eq!(sb.open(&blob).unwrap().as_slice(), b"hello license");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let sb = sealed_box();
        let a = sb.seal(b"same").unwrap();
        let b = sb.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_tag_rejected() {
        let sb = sealed_box();
        let mut blob = sb.seal(b"payload").unwrap();
        blob[0] ^= 0x01;
        assert!(matches!(sb.open(&blob), Err(CryptoError::IntegrityMismatch)));
    }

    #[test]
    fn test_tamper_ciphertext_rejected_before_decrypt() {
        let sb = sealed_box();
        let mut blob = sb.seal(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x80;
        assert!(matches!(sb.open(&blob), Err(CryptoError::IntegrityMismatch)));
    }

    #[test]
    fn test_short_blob_rejected() {
        let sb = sealed_box();
        let err = sb.open(&[0u8; 10]).unwrap_err();
        assert!(err.is_tamper());
    }

    #[test]
    fn test_wrong_machine_cannot_open() {
        let blob = sealed_box().seal(b"payload").unwrap();
        let other = SealedBox::from_deriver(&KeyDeriver::new("other-machine", "app"));
        assert!(other.open(&blob).is_err());
    }

    #[test]
    fn test_base64_roundtrip() {
        let sb = sealed_box();
        let encoded = sb.seal_base64(b"{\"valid\":true}").unwrap();
        assert_eq!(
            sb.open_base64(&encoded).unwrap().as_slice(),
            b"{\"valid\":true}"
        );
        assert!(sb.open_base64("not base64!!").is_err());
    }

    #[test]
    fn test_layout() {
        let sb = sealed_box();
        let nonce = [7u8; NONCE_LEN];
        let blob = sb.seal_with_nonce(b"abc", nonce).unwrap();
        assert_eq!(&blob[TAG_LEN..TAG_LEN + NONCE_LEN], &nonce);
        // 3 bytes plaintext + 16 bytes GCM tag
        assert_eq!(blob.len(), TAG_LEN + NONCE_LEN + 3 + 16);
    }
}
