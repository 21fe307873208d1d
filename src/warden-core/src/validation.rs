//! License validation state machine.
//!
//! [`LicenseClient`] owns the authorization record, talks to the server
//! through a [`LicenseTransport`] and writes through the
//! [`CredentialStore`]. The local verdict is computed in four stages that
//! short-circuit on the first failure:
//!
//! ```text
//! basic ──▶ expiration ──▶ offline grace ──▶ signature integrity
//!  │            │               │                    │
//!  valid flag   expire_at       online verify when   cached signature
//!  + record     (RFC3339)       grace is exceeded    re-verified
//! ```
//!
//! Server responses are signature-checked before any of their fields are
//! applied; a rejected response leaves the record untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::cache::{current_timestamp, CacheStatus, CredentialStore};
use crate::config::LicenseConfig;
use crate::error::LicenseError;
use crate::fingerprint::machine_fingerprint;
use crate::https::HttpsClient;
use crate::license::{AuthorizationRecord, DeviceInfo, UpdateInfo};
use crate::scheduler::{Interval, PeriodicTask};
use crate::signature::SignatureVerifier;
use crate::transport::LicenseTransport;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Coarse authorization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    /// No record, or the server said the license is not valid.
    Unauthenticated,
    /// Record present and every local check passes.
    Authenticated,
    /// `expire_at` is in the past.
    Expired,
    /// Signature enforcement is on and the cached signature does not verify.
    SignatureInvalid,
    /// Offline longer than the grace period; the next check goes online.
    OfflineExceeded,
    /// A tamper detection flagged this session.
    Compromised,
}

impl std::fmt::Display for LicenseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::Expired => "expired",
            Self::SignatureInvalid => "signature_invalid",
            Self::OfflineExceeded => "offline_exceeded",
            Self::Compromised => "compromised",
        };
        f.write_str(label)
    }
}

/// Client-side password transform sent with `password_hashed: true`.
///
/// `hex(SHA-256("<password>:<lowercase email>:license_salt_v1"))`
#[must_use]
pub fn hash_password(password: &str, email: &str) -> String {
    let salted = format!("{password}:{}:license_salt_v1", email.to_lowercase());
    hex::encode(Sha256::digest(salted.as_bytes()))
}

struct Inner {
    config: LicenseConfig,
    machine_id: String,
    transport: Arc<dyn LicenseTransport>,
    signatures: RwLock<Arc<SignatureVerifier>>,
    store: CredentialStore,
    record: RwLock<Option<AuthorizationRecord>>,
    compromised: AtomicBool,
    heartbeat: PeriodicTask,
}

/// Handle to a license session. Clones share state.
#[derive(Clone)]
pub struct LicenseClient {
    inner: Arc<Inner>,
}

impl LicenseClient {
    /// Create a client talking HTTPS to `config.server_url`.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is incomplete or the TLS setup fails.
    pub fn new(config: LicenseConfig) -> Result<Self, LicenseError> {
        config.validate()?;
        let transport = Arc::new(HttpsClient::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create a client over a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is incomplete.
    pub fn with_transport(
        config: LicenseConfig,
        transport: Arc<dyn LicenseTransport>,
    ) -> Result<Self, LicenseError> {
        Self::with_machine_id(config, transport, machine_fingerprint())
    }

    /// Create a client bound to an explicit machine id.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is incomplete.
    pub fn with_machine_id(
        config: LicenseConfig,
        transport: Arc<dyn LicenseTransport>,
        machine_id: impl Into<String>,
    ) -> Result<Self, LicenseError> {
        config.validate()?;
        let machine_id = machine_id.into();
        let signatures = Arc::new(SignatureVerifier::new(
            config.server_public_key.as_deref(),
            config.require_signature,
            config.signature_window_secs,
        ));
        let store = CredentialStore::new(
            &config.cache_dir,
            config.app_key.as_str(),
            &machine_id,
            config.encrypt_cache,
        );
        let record = store.load(&signatures);
        info!(
            app_key = %config.app_key,
            cached = record.is_some(),
            signatures = signatures.is_enabled(),
            "LicenseClient: initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                machine_id,
                transport,
                signatures: RwLock::new(signatures),
                store,
                record: RwLock::new(record),
                compromised: AtomicBool::new(false),
                heartbeat: PeriodicTask::new("heartbeat"),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Server operations
    // ------------------------------------------------------------------

    /// Activate this machine with a license key.
    ///
    /// # Errors
    ///
    /// Transport, API or signature errors. State is unchanged on error.
    #[instrument(skip(self, license_key))]
    pub async fn activate(&self, license_key: &str) -> Result<AuthorizationRecord, LicenseError> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "license_key": license_key,
            "machine_id": self.inner.machine_id,
            "device_info": DeviceInfo::current(&self.inner.config.app_version),
        });
        let data = self.inner.transport.post("/auth/activate", body).await?;
        let mut record = self.accept(&data)?;
        record.license_key = Some(license_key.to_string());
        Ok(self.authorize(record))
    }

    /// Log in with account credentials.
    ///
    /// The password is sent through [`hash_password`], never in clear.
    ///
    /// # Errors
    ///
    /// Transport, API or signature errors. State is unchanged on error.
    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthorizationRecord, LicenseError> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "email": email,
            "password": hash_password(password, email),
            "password_hashed": true,
            "machine_id": self.inner.machine_id,
            "device_info": DeviceInfo::current(&self.inner.config.app_version),
        });
        let data = self.inner.transport.post("/auth/login", body).await?;
        let mut record = self.accept(&data)?;
        record.email = Some(email.to_string());
        Ok(self.authorize(record))
    }

    /// Create an account. Returns the server's `data` object.
    ///
    /// # Errors
    ///
    /// Transport or API errors.
    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<Map<String, Value>, LicenseError> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "email": email,
            "password": hash_password(password, email),
            "password_hashed": true,
            "name": name,
        });
        self.inner.transport.post("/auth/register", body).await
    }

    /// Change the account password.
    ///
    /// `email` falls back to the email of the current record.
    ///
    /// # Errors
    ///
    /// `Config` if no email is known, otherwise transport or API errors.
    #[instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
        email: Option<&str>,
    ) -> Result<Map<String, Value>, LicenseError> {
        let email = email
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .or_else(|| self.snapshot().and_then(|r| r.email))
            .filter(|e| !e.is_empty())
            .ok_or_else(|| LicenseError::config("an email is required to change the password"))?;
        let body = json!({
            "app_key": self.inner.config.app_key,
            "old_password": hash_password(old_password, &email),
            "new_password": hash_password(new_password, &email),
            "password_hashed": true,
            "machine_id": self.inner.machine_id,
        });
        self.inner.transport.post("/auth/change-password", body).await
    }

    /// Online verification. Returns the server's verdict.
    ///
    /// # Errors
    ///
    /// Transport, API or signature errors. State is unchanged on error.
    #[instrument(skip(self))]
    pub async fn verify(&self) -> Result<bool, LicenseError> {
        let data = self
            .inner
            .transport
            .post("/auth/verify", self.identity())
            .await?;
        self.apply_status(&data)
    }

    /// Heartbeat. Returns the server's verdict.
    ///
    /// # Errors
    ///
    /// Transport, API or signature errors. State is unchanged on error.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self) -> Result<bool, LicenseError> {
        let data = self
            .inner
            .transport
            .post("/auth/heartbeat", self.versioned_identity())
            .await?;
        self.apply_status(&data)
    }

    /// Subscription-mode verification.
    ///
    /// # Errors
    ///
    /// Transport, API or signature errors. State is unchanged on error.
    #[instrument(skip(self))]
    pub async fn subscription_verify(&self) -> Result<bool, LicenseError> {
        let data = self
            .inner
            .transport
            .post("/subscription/verify", self.identity())
            .await?;
        self.apply_status(&data)
    }

    /// Subscription-mode heartbeat.
    ///
    /// # Errors
    ///
    /// Transport, API or signature errors. State is unchanged on error.
    #[instrument(skip(self))]
    pub async fn subscription_heartbeat(&self) -> Result<bool, LicenseError> {
        let data = self
            .inner
            .transport
            .post("/subscription/heartbeat", self.versioned_identity())
            .await?;
        self.apply_status(&data)
    }

    /// Release this machine's seat, then drop all local credentials.
    ///
    /// # Errors
    ///
    /// Transport or API errors; local state is kept on error.
    #[instrument(skip(self))]
    pub async fn deactivate(&self) -> Result<(), LicenseError> {
        self.inner
            .transport
            .post("/auth/deactivate", self.identity())
            .await?;
        self.clear_cache();
        self.inner.heartbeat.stop();
        info!("LicenseClient: deactivated");
        Ok(())
    }

    /// Latest release for this application.
    ///
    /// # Errors
    ///
    /// Transport or API errors, or `InvalidResponse` for a malformed body.
    #[instrument(skip(self))]
    pub async fn check_update(&self) -> Result<UpdateInfo, LicenseError> {
        let path = format!("/releases/latest?app_key={}", self.inner.config.app_key);
        let data = self.inner.transport.get(&path).await?;
        serde_json::from_value(data)
            .map_err(|e| LicenseError::invalid_response(format!("update info: {e}")))
    }

    // ------------------------------------------------------------------
    // Local verdict
    // ------------------------------------------------------------------

    /// Whether the license is usable now. Goes online only when the
    /// offline grace period is exceeded.
    pub async fn is_valid(&self) -> bool {
        if !self.check_basic() {
            return false;
        }
        if !self.check_expiration_at(current_timestamp()) {
            return false;
        }
        if !self.check_offline_grace().await {
            return false;
        }
        self.check_signature_integrity()
    }

    /// Basic check followed by a mandatory online verification.
    pub async fn is_valid_strict(&self) -> bool {
        if !self.check_basic() {
            return false;
        }
        self.verify_online().await
    }

    /// Current coarse state, computed without network access.
    #[must_use]
    pub fn state(&self) -> LicenseState {
        self.state_at(current_timestamp())
    }

    /// [`state`](Self::state) as of `now` (Unix seconds).
    #[must_use]
    pub fn state_at(&self, now: i64) -> LicenseState {
        if self.is_compromised() {
            return LicenseState::Compromised;
        }
        if !self.check_basic() {
            return LicenseState::Unauthenticated;
        }
        if !self.check_expiration_at(now) {
            return LicenseState::Expired;
        }
        if !self.check_signature_integrity() {
            return LicenseState::SignatureInvalid;
        }
        if self.offline_exceeded_at(now) {
            return LicenseState::OfflineExceeded;
        }
        LicenseState::Authenticated
    }

    fn check_basic(&self) -> bool {
        if self.is_compromised() {
            return false;
        }
        self.read_record(|r| r.is_some_and(|r| r.valid))
    }

    fn check_expiration_at(&self, now: i64) -> bool {
        let expire_at = self.read_record(|r| r.and_then(|r| r.expire_at.clone()));
        let Some(expire_at) = expire_at.filter(|e| !e.is_empty()) else {
            return true;
        };
        match chrono::DateTime::parse_from_rfc3339(&expire_at) {
            Ok(expiry) => now < expiry.timestamp(),
            Err(_) => true,
        }
    }

    fn offline_exceeded_at(&self, now: i64) -> bool {
        let Some(last) = self.read_record(|r| r.map(|r| r.last_verified_at)) else {
            return true;
        };
        let offline_days = (now - last) as f64 / SECONDS_PER_DAY;
        offline_days > f64::from(self.inner.config.offline_grace_days)
    }

    async fn check_offline_grace(&self) -> bool {
        if !self.offline_exceeded_at(current_timestamp()) {
            return true;
        }
        debug!("LicenseClient: offline grace exceeded, verifying online");
        self.verify_online().await
    }

    fn check_signature_integrity(&self) -> bool {
        let signatures = self.signatures();
        if !signatures.is_enabled() {
            return true;
        }
        self.read_record(|r| match r {
            Some(record) if record.signature.is_some() => {
                signatures.verify_cached(record).is_ok()
            },
            _ => false,
        })
    }

    async fn verify_online(&self) -> bool {
        match self.verify().await {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, "LicenseClient: online verification failed");
                false
            },
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Granted features, in server order.
    #[must_use]
    pub fn features(&self) -> Vec<String> {
        self.read_record(|r| r.map(|r| r.features.clone()).unwrap_or_default())
    }

    /// Whether the record grants `feature`.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.read_record(|r| r.is_some_and(|r| r.has_feature(feature)))
    }

    /// Days left as reported by the server; 0 without a record.
    #[must_use]
    pub fn remaining_days(&self) -> i64 {
        self.read_record(|r| r.map_or(0, |r| r.remaining_days))
    }

    /// Copy of the current record.
    #[must_use]
    pub fn license_info(&self) -> Option<AuthorizationRecord> {
        self.snapshot()
    }

    /// Machine fingerprint this client is bound to.
    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.inner.machine_id
    }

    /// Application key.
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.inner.config.app_key
    }

    /// Server base URL.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.inner.config.server_url
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &LicenseConfig {
        &self.inner.config
    }

    /// Whether response signatures are enforced.
    #[must_use]
    pub fn is_signature_enabled(&self) -> bool {
        self.signatures().is_enabled()
    }

    /// Install the server public key and turn enforcement on.
    pub fn set_public_key(&self, pem: &str) {
        let verifier = Arc::new(SignatureVerifier::new(
            Some(pem),
            true,
            self.inner.config.signature_window_secs,
        ));
        *self
            .inner
            .signatures
            .write()
            .unwrap_or_else(PoisonError::into_inner) = verifier;
        info!("LicenseClient: server public key installed, signatures enforced");
    }

    /// State of the on-disk cache.
    #[must_use]
    pub fn cache_status(&self) -> CacheStatus {
        self.inner.store.inspect(&self.signatures())
    }

    /// Whether the heartbeat loop is running.
    #[must_use]
    pub fn is_heartbeat_running(&self) -> bool {
        self.inner.heartbeat.is_running()
    }

    // ------------------------------------------------------------------
    // Tamper hooks
    // ------------------------------------------------------------------

    /// Flag the session as compromised and drop local credentials.
    pub fn mark_compromised(&self) {
        self.inner.compromised.store(true, Ordering::Release);
        self.clear_cache();
        debug!(category = "compromised", "LicenseClient: session flagged");
    }

    /// Whether the session has been flagged.
    #[must_use]
    pub fn is_compromised(&self) -> bool {
        self.inner.compromised.load(Ordering::Acquire)
    }

    /// Remove the cache files and the in-memory record.
    pub fn clear_cache(&self) {
        self.inner.store.clear();
        *self.write_record() = None;
    }

    /// Stop background work.
    pub fn close(&self) {
        self.inner.heartbeat.stop();
        debug!("LicenseClient: closed");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn signatures(&self) -> Arc<SignatureVerifier> {
        Arc::clone(
            &self
                .inner
                .signatures
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn read_record<T>(&self, f: impl FnOnce(Option<&AuthorizationRecord>) -> T) -> T {
        let guard = self
            .inner
            .record
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(guard.as_ref())
    }

    fn write_record(&self) -> std::sync::RwLockWriteGuard<'_, Option<AuthorizationRecord>> {
        self.inner
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Option<AuthorizationRecord> {
        self.read_record(|r| r.cloned())
    }

    fn identity(&self) -> Value {
        json!({
            "app_key": self.inner.config.app_key,
            "machine_id": self.inner.machine_id,
        })
    }

    fn versioned_identity(&self) -> Value {
        json!({
            "app_key": self.inner.config.app_key,
            "machine_id": self.inner.machine_id,
            "app_version": self.inner.config.app_version,
        })
    }

    /// Verify a full license payload and build a record from it.
    fn accept(&self, data: &Map<String, Value>) -> Result<AuthorizationRecord, LicenseError> {
        if let Err(e) = self.signatures().verify_payload(data) {
            warn!(error = %e, "LicenseClient: rejecting unverified license payload");
            return Err(e);
        }
        Ok(AuthorizationRecord::from_payload(data))
    }

    /// Install a freshly verified record and start the heartbeat.
    fn authorize(&self, mut record: AuthorizationRecord) -> AuthorizationRecord {
        record.last_verified_at = current_timestamp();
        *self.write_record() = Some(record.clone());
        self.persist();
        self.inner.compromised.store(false, Ordering::Release);
        self.start_heartbeat();
        info!(
            valid = record.valid,
            features = record.features.len(),
            "LicenseClient: authorized"
        );
        record
    }

    /// Apply a verified status response to the current record.
    fn apply_status(&self, data: &Map<String, Value>) -> Result<bool, LicenseError> {
        if let Err(e) = self.signatures().verify_payload(data) {
            warn!(error = %e, "LicenseClient: rejecting unverified status response");
            return Err(e);
        }
        let valid = data.get("valid").and_then(Value::as_bool).unwrap_or(false);
        let now = current_timestamp();
        let updated = {
            let mut guard = self.write_record();
            match guard.as_mut() {
                Some(record) => {
                    if data.contains_key("device_id") {
                        record.refresh_from(AuthorizationRecord::from_payload(data));
                    } else {
                        record.valid = valid;
                    }
                    record.last_verified_at = now;
                    true
                },
                None => false,
            }
        };
        if updated {
            self.persist();
        }
        debug!(valid, "LicenseClient: status applied");
        Ok(valid)
    }

    fn persist(&self) {
        let Some(record) = self.snapshot() else {
            return;
        };
        if let Err(e) = self.inner.store.save(&record) {
            warn!(error = %e, "LicenseClient: failed to persist credentials");
        }
    }

    fn start_heartbeat(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = Interval::Fixed(self.inner.config.heartbeat_interval);
        self.inner.heartbeat.start(interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let client = LicenseClient { inner };
                if let Err(e) = client.heartbeat().await {
                    debug!(error = %e, "LicenseClient: heartbeat failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for LicenseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseClient")
            .field("app_key", &self.inner.config.app_key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
