//! Credential store with encrypted, integrity-checked persistence.
//!
//! One file per application key:
//!
//! - `<cache_dir>/<app_key>.enc`: `base64(HMAC || nonce || AES-256-GCM(envelope))`
//! - `<cache_dir>/<app_key>.json`: legacy or development plaintext record
//!
//! The envelope is `{"data": base64(record_json), "timestamp": unix_secs}`;
//! envelopes older than [`MAX_CACHE_AGE_SECS`] are rejected. Any load
//! failure deletes the file, so a tampered cache forces re-verification.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use warden_crypto::{CryptoError, KeyDeriver, SealedBox};

use crate::error::LicenseError;
use crate::license::AuthorizationRecord;
use crate::signature::SignatureVerifier;

/// Maximum age of an encrypted cache envelope (30 days).
pub const MAX_CACHE_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Plaintext wrapped inside the sealed blob.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    data: String,
    timestamp: i64,
}

/// Result of inspecting the cache without modifying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// No cache file.
    Missing,
    /// Cache opens and its record is intact.
    Valid,
    /// Envelope is older than the maximum age.
    Expired,
    /// Integrity, decryption, parse or signature failure.
    Tampered,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Valid => write!(f, "valid"),
            Self::Expired => write!(f, "expired"),
            Self::Tampered => write!(f, "tampered"),
        }
    }
}

/// Persistent store for the [`AuthorizationRecord`].
pub struct CredentialStore {
    cache_dir: PathBuf,
    app_key: String,
    encrypt: bool,
    sealed: SealedBox,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create a store for `app_key` under `cache_dir`, with keys bound to `fingerprint`.
    #[must_use]
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        app_key: impl Into<String>,
        fingerprint: &str,
        encrypt: bool,
    ) -> Self {
        let app_key = app_key.into();
        let sealed = SealedBox::from_deriver(&KeyDeriver::new(fingerprint, app_key.as_str()));
        Self {
            cache_dir: cache_dir.into(),
            app_key,
            encrypt,
            sealed,
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the active cache file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        if self.encrypt {
            self.cache_dir.join(format!("{}.enc", self.app_key))
        } else {
            self.legacy_path()
        }
    }

    /// Path of the legacy plaintext file.
    #[must_use]
    pub fn legacy_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.json", self.app_key))
    }

    /// Whether the cache is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Persist `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, encryption or the write fails.
    pub fn save(&self, record: &AuthorizationRecord) -> Result<(), LicenseError> {
        self.save_at(record, current_timestamp())
    }

    /// Persist `record` with the envelope stamped at `now`.
    ///
    /// # Errors
    ///
    /// See [`CredentialStore::save`].
    pub fn save_at(&self, record: &AuthorizationRecord, now: i64) -> Result<(), LicenseError> {
        let json = serde_json::to_vec_pretty(record)?;
        let contents = if self.encrypt {
            let envelope = Envelope {
                data: BASE64.encode(&json),
                timestamp: now,
            };
            self.sealed
                .seal_base64(&serde_json::to_vec(&envelope)?)?
                .into_bytes()
        } else {
            json
        };

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| LicenseError::cache("write lock poisoned"))?;
        fs::create_dir_all(&self.cache_dir)?;
        write_atomic(&self.path(), &contents)?;
        debug!(
            path = %self.path().display(),
            encrypted = self.encrypt,
            "Cache: saved credential record"
        );
        Ok(())
    }

    /// Load the record; every failure collapses to `None`.
    #[must_use]
    pub fn load(&self, signatures: &SignatureVerifier) -> Option<AuthorizationRecord> {
        self.load_checked(signatures).ok()
    }

    /// Load the record, reporting why it was rejected.
    ///
    /// A rejected cache file is deleted.
    ///
    /// # Errors
    ///
    /// `CacheIntegrityFailure`, `CacheExpired`, a signature error, or `Cache`
    /// when no usable file exists.
    pub fn load_checked(
        &self,
        signatures: &SignatureVerifier,
    ) -> Result<AuthorizationRecord, LicenseError> {
        self.load_at(signatures, current_timestamp())
    }

    /// Load as of `now` (Unix seconds).
    ///
    /// # Errors
    ///
    /// See [`CredentialStore::load_checked`].
    pub fn load_at(
        &self,
        signatures: &SignatureVerifier,
        now: i64,
    ) -> Result<AuthorizationRecord, LicenseError> {
        let path = self.path();
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.migrate_legacy(signatures);
            },
            Err(e) => return Err(e.into()),
        };

        match self.decode(&contents, signatures, now) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(reason = %e, "Cache: rejecting credential cache");
                remove_quietly(&path);
                Err(e)
            },
        }
    }

    /// Report the cache state without deleting anything.
    #[must_use]
    pub fn inspect(&self, signatures: &SignatureVerifier) -> CacheStatus {
        let Ok(contents) = fs::read(self.path()) else {
            return CacheStatus::Missing;
        };
        match self.decode(&contents, signatures, current_timestamp()) {
            Ok(_) => CacheStatus::Valid,
            Err(LicenseError::CacheExpired) => CacheStatus::Expired,
            Err(_) => CacheStatus::Tampered,
        }
    }

    /// Remove the cache and the legacy file. Best effort.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        remove_quietly(&self.path());
        remove_quietly(&self.legacy_path());
        debug!("Cache: cleared");
    }

    fn decode(
        &self,
        contents: &[u8],
        signatures: &SignatureVerifier,
        now: i64,
    ) -> Result<AuthorizationRecord, LicenseError> {
        let json = if self.encrypt {
            let encoded = std::str::from_utf8(contents)
                .map_err(|_| LicenseError::CacheIntegrityFailure)?;
            let plaintext = self.sealed.open_base64(encoded).map_err(map_seal_error)?;
            let envelope: Envelope = serde_json::from_slice(&plaintext)
                .map_err(|_| LicenseError::CacheIntegrityFailure)?;
            if now - envelope.timestamp > MAX_CACHE_AGE_SECS {
                return Err(LicenseError::CacheExpired);
            }
            BASE64
                .decode(envelope.data)
                .map_err(|_| LicenseError::CacheIntegrityFailure)?
        } else {
            contents.to_vec()
        };

        let record: AuthorizationRecord =
            serde_json::from_slice(&json).map_err(|e| LicenseError::cache(e.to_string()))?;

        if signatures.requires_signature() && signatures.has_public_key() {
            if record.signature.is_none() {
                return Err(LicenseError::SignatureMissing);
            }
            signatures.verify_cached(&record)?;
        }
        Ok(record)
    }

    fn migrate_legacy(
        &self,
        signatures: &SignatureVerifier,
    ) -> Result<AuthorizationRecord, LicenseError> {
        if !self.encrypt {
            return Err(LicenseError::cache("no cached credentials"));
        }
        let legacy = self.legacy_path();
        let Ok(contents) = fs::read(&legacy) else {
            return Err(LicenseError::cache("no cached credentials"));
        };
        remove_quietly(&legacy);

        let record: AuthorizationRecord = serde_json::from_slice(&contents)
            .map_err(|e| LicenseError::cache(format!("legacy cache: {e}")))?;
        if record.signature.is_none() || !signatures.has_public_key() {
            warn!("Cache: discarding unsigned legacy cache");
            return Err(LicenseError::cache("legacy cache is not signed"));
        }
        signatures.verify_cached(&record)?;

        self.save(&record)?;
        debug!("Cache: migrated legacy plaintext cache");
        Ok(record)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("cache_dir", &self.cache_dir)
            .field("encrypt", &self.encrypt)
            .finish_non_exhaustive()
    }
}

fn map_seal_error(e: CryptoError) -> LicenseError {
    if e.is_tamper() {
        LicenseError::CacheIntegrityFailure
    } else {
        LicenseError::Crypto(e)
    }
}

/// Write to a temp file in the same directory, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", crate::security::random::hex(8)));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| {
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        remove_quietly(&tmp);
    }
    result
}

pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), "Cache: failed to remove file: {}", e),
    }
}

/// Get current Unix timestamp.
pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record() -> AuthorizationRecord {
        AuthorizationRecord {
            valid: true,
            license_id: Some("lic-123".into()),
            device_id: "dev-1".into(),
            remaining_days: 30,
            features: vec!["export".into()],
            last_verified_at: current_timestamp(),
            ..Default::default()
        }
    }

    fn lax() -> SignatureVerifier {
        SignatureVerifier::new(None, false, 300)
    }

    fn store(dir: &Path) -> CredentialStore {
        CredentialStore::new(dir, "app-key", "0123456789abcdef0123456789abcdef", true)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = create_test_record();
        store.save(&record).unwrap();
        assert_eq!(store.load(&lax()), Some(record));
        assert!(store.path().ends_with("app-key.enc"));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(dir.path()).load(&lax()), None);
        assert_eq!(store(dir.path()).inspect(&lax()), CacheStatus::Missing);
    }

    #[test]
    fn test_bit_flip_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save(&create_test_record()).unwrap();

        let mut raw = BASE64.decode(fs::read(store.path()).unwrap()).unwrap();
        raw[40] ^= 0x01;
        fs::write(store.path(), BASE64.encode(raw)).unwrap();

        assert_eq!(store.inspect(&lax()), CacheStatus::Tampered);
        assert!(matches!(
            store.load_checked(&lax()),
            Err(LicenseError::CacheIntegrityFailure)
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_expired_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let now = current_timestamp();
        store
            .save_at(&create_test_record(), now - 31 * 24 * 60 * 60)
            .unwrap();
        assert_eq!(store.inspect(&lax()), CacheStatus::Expired);
        assert!(matches!(
            store.load_at(&lax(), now),
            Err(LicenseError::CacheExpired)
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_other_machine_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path()).save(&create_test_record()).unwrap();
        let other = CredentialStore::new(dir.path(), "app-key", "ffffffffffffffffffffffffffffffff", true);
        assert_eq!(other.load(&lax()), None);
    }

    #[test]
    fn test_plaintext_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), "app-key", "fp", false);
        store.save(&create_test_record()).unwrap();
        assert!(store.path().ends_with("app-key.json"));
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"device_id\""));
        assert!(store.load(&lax()).is_some());
    }

    #[test]
    fn test_unsigned_legacy_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(
            store.legacy_path(),
            serde_json::to_vec(&create_test_record()).unwrap(),
        )
        .unwrap();
        assert_eq!(store.load(&lax()), None);
        assert!(!store.legacy_path().exists());
    }

    #[test]
    fn test_clear_removes_both() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save(&create_test_record()).unwrap();
        fs::write(store.legacy_path(), b"{}").unwrap();
        store.clear();
        assert!(!store.path().exists());
        assert!(!store.legacy_path().exists());
    }

    #[test]
    fn test_unsigned_record_rejected_when_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save(&create_test_record()).unwrap();
        let strict = SignatureVerifier::new(Some("malformed"), true, 300);
        assert!(matches!(
            store.load_checked(&strict),
            Err(LicenseError::SignatureMissing)
        ));
        assert!(!store.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save(&create_test_record()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
