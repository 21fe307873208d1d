//! Server response signatures.
//!
//! The server signs the canonical JSON of each response payload:
//!
//! ```text
//! canonical = compact JSON, keys sorted at every level, "signature" removed
//! signature = base64( RSA-PKCS1v15( SHA-256(canonical) ) )
//! ```
//!
//! A numeric `timestamp` in the payload is checked against a replay window.
//!
//! | key | signature | require | outcome |
//! |-----|-----------|---------|---------|
//! | no  | -         | false   | accept unsigned |
//! | no  | -         | true    | `InvalidPublicKey` |
//! | yes | no        | false   | accept |
//! | yes | no        | true    | `SignatureMissing` |
//! | yes | yes       | any     | verify |

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::debug;
use warden_crypto::{PayloadVerifier, RsaVerifier};

use crate::error::LicenseError;
use crate::license::{json_i64, AuthorizationRecord};

/// Serialize `payload` without its `signature` key, keys sorted recursively.
///
/// # Errors
///
/// Returns [`LicenseError::Json`] if serialization fails.
pub fn canonical_json(payload: &Map<String, Value>) -> Result<Vec<u8>, LicenseError> {
    let mut keys: Vec<&String> = payload.keys().filter(|k| *k != "signature").collect();
    keys.sort();
    let mut sorted = Map::new();
    for key in keys {
        sorted.insert(key.clone(), canonicalize(&payload[key.as_str()]));
    }
    Ok(serde_json::to_vec(&Value::Object(sorted))?)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

enum KeyState {
    Absent,
    Malformed(String),
    Ready(Box<dyn PayloadVerifier + Send + Sync>),
}

/// Verifies signed server payloads under a configured policy.
pub struct SignatureVerifier {
    key: KeyState,
    require_signature: bool,
    window_secs: u64,
}

impl SignatureVerifier {
    /// Create a verifier.
    ///
    /// A malformed PEM does not fail construction; every verification
    /// against it fails with [`LicenseError::InvalidPublicKey`].
    #[must_use]
    pub fn new(public_key_pem: Option<&str>, require_signature: bool, window_secs: u64) -> Self {
        let key = match public_key_pem.map(str::trim).filter(|p| !p.is_empty()) {
            None => KeyState::Absent,
            Some(pem) => match RsaVerifier::from_pem(pem) {
                Ok(v) => KeyState::Ready(Box::new(v)),
                Err(e) => KeyState::Malformed(e.to_string()),
            },
        };
        Self {
            key,
            require_signature,
            window_secs,
        }
    }

    /// Whether a public key is configured (even if malformed).
    #[must_use]
    pub fn has_public_key(&self) -> bool {
        !matches!(self.key, KeyState::Absent)
    }

    /// Whether signatures are enforced.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.has_public_key() && self.require_signature
    }

    /// Whether unsigned payloads are refused.
    #[must_use]
    pub fn requires_signature(&self) -> bool {
        self.require_signature
    }

    /// Verify a payload using its embedded `signature` field.
    ///
    /// # Errors
    ///
    /// See [`SignatureVerifier::verify`].
    pub fn verify_payload(&self, payload: &Map<String, Value>) -> Result<(), LicenseError> {
        let signature = payload.get("signature").and_then(Value::as_str);
        self.verify(payload, signature)
    }

    /// Verify `signature` over `payload` at the current time.
    ///
    /// # Errors
    ///
    /// `InvalidPublicKey`, `SignatureMissing`, `SignatureExpired` or
    /// `SignatureVerificationFailed` per the policy table.
    pub fn verify(
        &self,
        payload: &Map<String, Value>,
        signature: Option<&str>,
    ) -> Result<(), LicenseError> {
        self.verify_at(payload, signature, chrono::Utc::now().timestamp())
    }

    /// Verify as of `now` (Unix seconds).
    ///
    /// # Errors
    ///
    /// See [`SignatureVerifier::verify`].
    pub fn verify_at(
        &self,
        payload: &Map<String, Value>,
        signature: Option<&str>,
        now: i64,
    ) -> Result<(), LicenseError> {
        self.check(payload, signature, Some(now))
    }

    /// Re-verify a cached record's signature over its signed fields.
    ///
    /// The replay window does not apply.
    ///
    /// # Errors
    ///
    /// See [`SignatureVerifier::verify`].
    pub fn verify_cached(&self, record: &AuthorizationRecord) -> Result<(), LicenseError> {
        self.check(&record.signed_fields(), record.signature.as_deref(), None)
    }

    fn check(
        &self,
        payload: &Map<String, Value>,
        signature: Option<&str>,
        now: Option<i64>,
    ) -> Result<(), LicenseError> {
        let verifier = match &self.key {
            KeyState::Absent if self.require_signature => {
                return Err(LicenseError::public_key("no public key configured"));
            }
            KeyState::Absent => return Ok(()),
            KeyState::Malformed(reason) => return Err(LicenseError::public_key(reason.clone())),
            KeyState::Ready(v) => v,
        };

        let Some(signature) = signature.filter(|s| !s.is_empty()) else {
            if self.require_signature {
                return Err(LicenseError::SignatureMissing);
            }
            return Ok(());
        };

        if let (Some(now), true) = (now, self.window_secs > 0) {
            if let Some(ts) = payload.get("timestamp").and_then(json_i64) {
                if now.abs_diff(ts) > self.window_secs {
                    debug!(timestamp = ts, now, "Signature: outside replay window");
                    return Err(LicenseError::SignatureExpired {
                        timestamp: ts,
                        window_secs: self.window_secs,
                    });
                }
            }
        }

        let raw = BASE64
            .decode(signature.trim())
            .map_err(|e| LicenseError::signature(format!("signature decode: {e}")))?;
        let canonical = canonical_json(payload)?;

        match verifier.verify(&canonical, &raw) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LicenseError::signature("signature does not match payload")),
            Err(e) => Err(LicenseError::signature(e.to_string())),
        }
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = match self.key {
            KeyState::Absent => "absent",
            KeyState::Malformed(_) => "malformed",
            KeyState::Ready(_) => "ready",
        };
        f.debug_struct("SignatureVerifier")
            .field("key", &key)
            .field("require_signature", &self.require_signature)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}
