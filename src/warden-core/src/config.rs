//! Configuration for the license client and the security tiers.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::LicenseError;

/// Configuration for a [`LicenseClient`](crate::LicenseClient).
#[derive(Debug, Clone)]
pub struct LicenseConfig {
    /// Base URL of the license server, without the `/api/client` suffix.
    pub server_url: String,
    /// Application key issued by the server.
    pub app_key: String,
    /// Directory holding the credential cache.
    pub cache_dir: PathBuf,
    /// Interval between background heartbeats.
    pub heartbeat_interval: Duration,
    /// Days the cached verdict is trusted without an online verify.
    pub offline_grace_days: u32,
    /// Application version reported to the server.
    pub app_version: String,
    /// Encrypt the cache (disable only for development).
    pub encrypt_cache: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries for network failures.
    pub max_retries: u32,
    /// PEM-encoded server public key for response signatures.
    pub server_public_key: Option<String>,
    /// Refuse unsigned responses.
    pub require_signature: bool,
    /// Replay window for signed timestamps, in seconds. Zero disables the check.
    pub signature_window_secs: u64,
    /// SHA-256 fingerprint of the server certificate to pin.
    pub cert_fingerprint: Option<String>,
    /// PEM file of trusted roots for the server.
    pub cert_file: Option<PathBuf>,
    /// Disable TLS validation entirely. Testing only.
    pub skip_verify: bool,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            app_key: String::new(),
            cache_dir: default_cache_dir(),
            heartbeat_interval: Duration::from_secs(60 * 60),
            offline_grace_days: 7,
            app_version: "1.0.0".into(),
            encrypt_cache: true,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            server_public_key: None,
            require_signature: false,
            signature_window_secs: 300,
            cert_fingerprint: None,
            cert_file: None,
            skip_verify: false,
        }
    }
}

impl LicenseConfig {
    /// Create a config for `server_url` and `app_key` with defaults elsewhere.
    #[must_use]
    pub fn new(server_url: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            app_key: app_key.into(),
            ..Self::default()
        }
    }

    /// Set the server public key; this also turns signature enforcement on.
    #[must_use]
    pub fn with_server_public_key(mut self, pem: impl Into<String>) -> Self {
        self.server_public_key = Some(pem.into());
        self.require_signature = true;
        self
    }

    /// Set the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Pin the server certificate by SHA-256 fingerprint.
    #[must_use]
    pub fn with_cert_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.cert_fingerprint = Some(fingerprint.into());
        self
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the app key or server URL is empty.
    pub fn validate(&self) -> Result<(), LicenseError> {
        if self.app_key.trim().is_empty() {
            return Err(LicenseError::config("app_key must not be empty"));
        }
        if self.server_url.trim().is_empty() {
            return Err(LicenseError::config("server_url must not be empty"));
        }
        Ok(())
    }

    /// Base URL for client API endpoints.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("{}/api/client", self.server_url.trim_end_matches('/'))
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".license_cache")
}

/// Cadences and thresholds for the security tiers.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Run the full baseline check every N calls to `is_valid`.
    pub full_check_every: u64,
    /// Run the full baseline check when the last one is older than this.
    pub full_check_max_age: Duration,
    /// Runtime integrity scan interval.
    pub integrity_interval: Duration,
    /// Lower bound of the random verification interval.
    pub random_verify_min: Duration,
    /// Upper bound of the random verification interval.
    pub random_verify_max: Duration,
    /// Continuous debugger check interval.
    pub anti_debug_interval: Duration,
    /// Calls per second to `is_valid` above which the session is compromised.
    pub max_calls_per_second: f64,
    /// Allowed backwards clock movement before rollback is reported.
    pub time_rollback_tolerance: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            full_check_every: 10,
            full_check_max_age: Duration::from_secs(300),
            integrity_interval: Duration::from_secs(30),
            random_verify_min: Duration::from_secs(60),
            random_verify_max: Duration::from_secs(300),
            anti_debug_interval: Duration::from_secs(5),
            max_calls_per_second: 100.0,
            time_rollback_tolerance: Duration::from_secs(300),
        }
    }
}
