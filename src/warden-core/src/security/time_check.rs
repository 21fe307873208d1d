//! Clock rollback detection.
//!
//! The latest observed time is persisted in `<cache_dir>/.time_check` as
//! `nonce[12] || AES-256-GCM("<ts>:<checksum>")`, keyed by
//! `SHA-256(hostname || "time_check_key_v2")`. The checksum is
//! `hex(SHA-256("<ts>:time_integrity_v2")[..8])`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use super::random;
use crate::cache::{current_timestamp, remove_quietly, write_atomic};

/// File name of the persisted timestamp.
pub const TIME_FILE: &str = ".time_check";

/// Default allowed backwards drift in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

const NONCE_LEN: usize = 12;

/// Detects the wall clock moving backwards across runs.
pub struct TimeChecker {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
    tolerance_secs: i64,
    last_seen: Mutex<i64>,
}

impl TimeChecker {
    /// Checker persisting under `cache_dir`, keyed by this host's name.
    pub fn new(cache_dir: &Path, tolerance_secs: i64) -> Self {
        Self::with_host(cache_dir, &crate::fingerprint::hostname(), tolerance_secs)
    }

    /// Checker keyed by an explicit host name.
    pub fn with_host(cache_dir: &Path, host: &str, tolerance_secs: i64) -> Self {
        let key: [u8; 32] = Sha256::new()
            .chain_update(host.as_bytes())
            .chain_update(b"time_check_key_v2")
            .finalize()
            .into();
        let checker = Self {
            path: cache_dir.join(TIME_FILE),
            key: Zeroizing::new(key),
            tolerance_secs,
            last_seen: Mutex::new(current_timestamp()),
        };
        checker.load();
        checker
    }

    /// Path of the persisted timestamp.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest time observed, in Unix seconds.
    pub fn last_seen(&self) -> i64 {
        self.last_seen.lock().map(|t| *t).unwrap_or(0)
    }

    /// `false` if the clock is behind the latest observed time by more
    /// than the tolerance; otherwise record now.
    pub fn check(&self) -> bool {
        self.check_at(current_timestamp())
    }

    /// [`check`](Self::check) with an explicit current time.
    pub fn check_at(&self, now: i64) -> bool {
        let Ok(mut last) = self.last_seen.lock() else {
            return false;
        };
        if now < *last - self.tolerance_secs {
            debug!(category = "time", "TimeCheck: rollback detected");
            return false;
        }
        let high = (*last).max(now);
        *last = high;
        self.save(high);
        true
    }

    fn load(&self) {
        let Ok(bytes) = std::fs::read(&self.path) else {
            return;
        };
        match self.decrypt(&bytes) {
            Some(ts) => {
                if let Ok(mut last) = self.last_seen.lock() {
                    *last = (*last).max(ts);
                }
            },
            None => {
                debug!("TimeCheck: discarding unreadable time file");
                remove_quietly(&self.path);
            },
        }
    }

    fn save(&self, ts: i64) {
        let Some(blob) = self.encrypt(ts) else {
            return;
        };
        if let Some(dir) = self.path.parent() {
            if std::fs::create_dir_all(dir).is_err() {
                return;
            }
        }
        if let Err(e) = write_atomic(&self.path, &blob) {
            debug!("TimeCheck: failed to persist: {}", e);
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()))
    }

    fn encrypt(&self, ts: i64) -> Option<Vec<u8>> {
        let plaintext = format!("{ts}:{}", checksum(ts));
        let nonce = random::bytes(NONCE_LEN);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .ok()?;
        let mut out = nonce;
        out.extend_from_slice(&ciphertext);
        Some(out)
    }

    fn decrypt(&self, blob: &[u8]) -> Option<i64> {
        if blob.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        let text = std::str::from_utf8(&plaintext).ok()?;
        let (ts, sum) = text.split_once(':')?;
        let ts: i64 = ts.parse().ok()?;
        (sum == checksum(ts)).then_some(ts)
    }
}

impl std::fmt::Debug for TimeChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeChecker")
            .field("path", &self.path)
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

fn checksum(ts: i64) -> String {
    let digest = Sha256::digest(format!("{ts}:time_integrity_v2").as_bytes());
    hex::encode(&digest[..8])
}
