//! RSA PKCS#1 v1.5 / SHA-256 signatures over server payloads.
//!
//! The server signs `SHA-256(canonical_json)` with its RSA private key; the
//! client holds the PEM-encoded public key (SPKI, with PKCS#1 accepted as a
//! fallback) and verifies.

use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Something that can produce signatures the client will verify.
pub trait PayloadSigner {
    /// PEM encoding of the matching public key.
    fn public_key_pem(&self) -> Result<String, CryptoError>;

    /// Sign data and return the raw signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Something that can verify server payload signatures.
pub trait PayloadVerifier {
    /// Verify `signature` over `data`.
    ///
    /// Returns `Ok(false)` for a well-formed but non-matching signature.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError>;
}

/// RSA-PKCS1v15-SHA256 verifier bound to one public key.
#[derive(Debug, Clone)]
pub struct RsaVerifier {
    key: RsaPublicKey,
}

impl RsaVerifier {
    /// Parse a PEM public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the PEM is neither SPKI nor PKCS#1.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let pem = pem.trim();
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;
        Ok(Self { key })
    }

    /// The wrapped public key.
    #[must_use]
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl PayloadVerifier for RsaVerifier {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        if signature.is_empty() {
            return Err(CryptoError::invalid_signature("empty signature"));
        }
        let hashed = Sha256::digest(data);
        match self
            .key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
        {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// RSA-PKCS1v15-SHA256 signer.
///
/// Used by tooling and tests to mint payloads; production clients only verify.
pub struct RsaSigner {
    key: RsaPrivateKey,
}

impl RsaSigner {
    /// Generate a fresh key of `bits` length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyGenerationFailed`] if generation fails.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::key_generation_failed(e.to_string()))?;
        Ok(Self { key })
    }

    /// Parse a PKCS#8 or PKCS#1 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPrivateKey`] on parse failure.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let pem = pem.trim();
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::invalid_private_key(e.to_string()))?;
        Ok(Self { key })
    }

    /// PKCS#8 PEM encoding of the private key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPrivateKey`] if encoding fails.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::invalid_private_key(e.to_string()))
    }

    /// A verifier for this signer's public key.
    #[must_use]
    pub fn verifier(&self) -> RsaVerifier {
        RsaVerifier {
            key: self.key.to_public_key(),
        }
    }
}

impl PayloadSigner for RsaSigner {
    fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let hashed = Sha256::digest(data);
        self.key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
            .map_err(|e| CryptoError::signing_failed(e.to_string()))
    }
}

impl std::fmt::Debug for RsaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RsaSigner { .. }")
    }
}
