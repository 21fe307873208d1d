//! Security tiers layered over [`LicenseClient`].
//!
//! ```text
//! HardenedClient ── honeypot, rate limit, obfuscated/distributed verdicts,
//!   │               runtime integrity, random re-verification,
//!   │               continuous anti-debug, critical features
//!   ▼
//! SecureClient ──── periodic full check: debugger, clock rollback,
//!   │               named validators
//!   ▼
//! LicenseClient ─── basic / expiration / offline grace / signature
//! ```
//!
//! Violations are silent: the cache is cleared and the verdict turns
//! false. Nothing here tells the caller which check fired.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::current_timestamp;
use crate::config::SecurityConfig;
use crate::error::LicenseError;
use crate::license::AuthorizationRecord;
use crate::scheduler::{Interval, PeriodicTask};
use crate::security::{
    AntiDebug, CallStackChecker, Challenge, ChallengeAnswer, ChallengeSolver, CodeIntrospector,
    DetectionHandler, DistributedResult, DistributedValidator, ExecutableIntegrity,
    HoneypotDetector, NativeIntrospector, ObfuscatedResult, ObfuscatedValidator,
    OpaquePredicates, ProtectedBool, PublicKeyProtector, RuntimeIntegrityChecker, TimeChecker,
    ValidationToken,
};
use crate::signature::SignatureVerifier;
use crate::validation::LicenseClient;

type NamedCheck = (&'static str, fn(&SecureClient) -> bool);

/// Checks run by the full baseline check, in order.
const VALIDATORS: [NamedCheck; 3] = [
    ("time", |sc| sc.time_checker.check()),
    ("license", |sc| sc.client.license_info().is_some()),
    ("valid_flag", |sc| sc.client.license_info().is_some_and(|r| r.valid)),
];

/// Baseline tier: periodic environment checks in front of the client.
pub struct SecureClient {
    client: LicenseClient,
    security: SecurityConfig,
    anti_debug: Arc<AntiDebug>,
    time_checker: TimeChecker,
    executable: ExecutableIntegrity,
    check_count: AtomicU64,
    last_full_check: AtomicI64,
    last_results: Mutex<Vec<bool>>,
}

impl SecureClient {
    /// Wrap `client` with the default debugger detector.
    #[must_use]
    pub fn new(client: LicenseClient, security: SecurityConfig) -> Self {
        Self::with_anti_debug(client, security, Arc::new(AntiDebug::new()))
    }

    /// Wrap `client` with a caller-supplied debugger detector.
    #[must_use]
    pub fn with_anti_debug(
        client: LicenseClient,
        security: SecurityConfig,
        anti_debug: Arc<AntiDebug>,
    ) -> Self {
        let tolerance = i64::try_from(security.time_rollback_tolerance.as_secs()).unwrap_or(i64::MAX);
        let time_checker = TimeChecker::new(&client.config().cache_dir, tolerance);
        Self {
            client,
            security,
            anti_debug,
            time_checker,
            executable: ExecutableIntegrity::new(),
            check_count: AtomicU64::new(0),
            last_full_check: AtomicI64::new(0),
            last_results: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped client.
    #[must_use]
    pub fn client(&self) -> &LicenseClient {
        &self.client
    }

    /// Tier settings.
    #[must_use]
    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    /// Verdict with a full environment check every N calls or after the
    /// last one grows stale.
    pub async fn is_valid(&self) -> bool {
        let count = self.check_count.fetch_add(1, Ordering::AcqRel) + 1;
        let now = current_timestamp();
        let stale = now - self.last_full_check.load(Ordering::Acquire)
            > i64::try_from(self.security.full_check_max_age.as_secs()).unwrap_or(i64::MAX);
        let every = self.security.full_check_every.max(1);
        if count % every == 0 || stale {
            if !self.full_check() {
                return false;
            }
            self.last_full_check.store(now, Ordering::Release);
        }
        self.client.is_valid().await
    }

    /// Debugger, clock rollback, then the named validators.
    fn full_check(&self) -> bool {
        if self.anti_debug.is_debugger_present() {
            return self.violation("debugger");
        }
        if !self.time_checker.check() {
            return self.violation("time");
        }
        let mut results = Vec::with_capacity(VALIDATORS.len());
        for (name, check) in VALIDATORS {
            let passed = check(self);
            results.push(passed);
            if !passed {
                self.store_results(results);
                debug!(validator = name, "SecureClient: validator failed");
                return self.violation("validation");
            }
        }
        self.store_results(results);
        true
    }

    fn store_results(&self, results: Vec<bool>) {
        *self
            .last_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = results;
    }

    fn violation(&self, category: &str) -> bool {
        debug!(category, "SecureClient: violation");
        self.client.clear_cache();
        false
    }

    /// Feature check gated on [`is_valid`](Self::is_valid).
    pub async fn has_feature(&self, feature: &str) -> bool {
        self.is_valid().await && self.client.has_feature(feature)
    }

    /// Remaining days gated on [`is_valid`](Self::is_valid).
    pub async fn remaining_days(&self) -> i64 {
        if !self.is_valid().await {
            return 0;
        }
        self.client.remaining_days()
    }

    /// See [`LicenseClient::activate`].
    ///
    /// # Errors
    ///
    /// As [`LicenseClient::activate`].
    pub async fn activate(&self, license_key: &str) -> Result<AuthorizationRecord, LicenseError> {
        self.client.activate(license_key).await
    }

    /// See [`LicenseClient::login`].
    ///
    /// # Errors
    ///
    /// As [`LicenseClient::login`].
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthorizationRecord, LicenseError> {
        self.client.login(email, password).await
    }

    /// See [`LicenseClient::deactivate`].
    ///
    /// # Errors
    ///
    /// As [`LicenseClient::deactivate`].
    pub async fn deactivate(&self) -> Result<(), LicenseError> {
        self.client.deactivate().await
    }

    /// Digest of the last validator results and the current time.
    #[must_use]
    pub fn validation_token(&self) -> String {
        let bits: String = self
            .last_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|&ok| if ok { '1' } else { '0' })
            .collect();
        hex::encode(Sha256::digest(format!("{bits}:{}", current_timestamp()).as_bytes()))
    }

    /// 32-hex token binding the executable digest, the validator results
    /// and the current time.
    #[must_use]
    pub fn security_token(&self) -> String {
        let combined = format!(
            "{}:{}:{}",
            self.executable.checksum(),
            self.validation_token(),
            current_timestamp()
        );
        hex::encode(Sha256::digest(combined.as_bytes()))[..32].to_string()
    }

    /// Stop the client's background work.
    pub fn close(&self) {
        self.client.close();
    }
}

impl std::fmt::Debug for SecureClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureClient")
            .field("client", &self.client)
            .field("checks", &self.check_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Snapshot reported by [`HardenedClient::security_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityStatus {
    /// Current verdict.
    pub is_valid: bool,
    /// A debugger has been seen at any point.
    pub debugger_detected: bool,
    /// The server public key is held by the fragment protector.
    pub public_key_protected: bool,
    /// A distributed result has been issued.
    pub has_validation_result: bool,
    /// Number of features that require online verification.
    pub critical_features_count: usize,
}

/// Hardened tier: every tamper check plus background monitoring.
pub struct HardenedClient {
    secure: Arc<SecureClient>,
    anti_debug: Arc<AntiDebug>,
    runtime: Arc<RuntimeIntegrityChecker>,
    honeypot: Arc<HoneypotDetector>,
    obfuscated: ObfuscatedValidator,
    challenge: ChallengeSolver,
    distributed: DistributedValidator,
    key_protector: PublicKeyProtector,
    opaque: OpaquePredicates,
    call_stack: CallStackChecker,
    random_verify: PeriodicTask,
    compromised: Arc<AtomicBool>,
    on_compromise: DetectionHandler,
    verdict: Mutex<ProtectedBool>,
    last_obfuscated: Mutex<Option<ObfuscatedResult>>,
    last_distributed: Mutex<Option<DistributedResult>>,
    critical_features: RwLock<HashSet<String>>,
}

impl HardenedClient {
    /// Wrap `client` with native detectors.
    #[must_use]
    pub fn new(client: LicenseClient, security: SecurityConfig) -> Self {
        Self::with_components(
            client,
            security,
            Arc::new(AntiDebug::new()),
            Arc::new(NativeIntrospector),
        )
    }

    /// Wrap `client` with caller-supplied detection backends.
    #[must_use]
    pub fn with_components(
        client: LicenseClient,
        security: SecurityConfig,
        anti_debug: Arc<AntiDebug>,
        introspector: Arc<dyn CodeIntrospector>,
    ) -> Self {
        let secret: [u8; 32] = Sha256::new()
            .chain_update(client.machine_id().as_bytes())
            .chain_update(client.app_key().as_bytes())
            .chain_update(b"advanced_security_v1")
            .finalize()
            .into();
        let distributed = DistributedValidator::new(client.machine_id(), client.app_key());
        let key_protector = PublicKeyProtector::new(client.machine_id());
        let compromised = Arc::new(AtomicBool::new(false));
        let on_compromise = compromise_handler(&client, &compromised);

        let runtime = Arc::new(RuntimeIntegrityChecker::with_introspector(introspector));
        register_critical_functions(&runtime);
        runtime.set_violation_handler(Arc::clone(&on_compromise));

        let honeypot = Arc::new(HoneypotDetector::new());
        honeypot.set_detection_handler(Arc::clone(&on_compromise));

        let secure = Arc::new(SecureClient::with_anti_debug(
            client,
            security,
            Arc::clone(&anti_debug),
        ));

        Self {
            secure,
            anti_debug,
            runtime,
            honeypot,
            obfuscated: ObfuscatedValidator::new(&secret),
            challenge: ChallengeSolver::new(&secret),
            distributed,
            key_protector,
            opaque: OpaquePredicates::new(),
            call_stack: CallStackChecker::new(),
            random_verify: PeriodicTask::new("random-verify"),
            compromised,
            on_compromise,
            verdict: Mutex::new(ProtectedBool::default()),
            last_obfuscated: Mutex::new(None),
            last_distributed: Mutex::new(None),
            critical_features: RwLock::new(HashSet::new()),
        }
    }

    /// The wrapped client.
    #[must_use]
    pub fn client(&self) -> &LicenseClient {
        self.secure.client()
    }

    /// The baseline tier underneath.
    #[must_use]
    pub fn secure(&self) -> &SecureClient {
        &self.secure
    }

    /// Caller allow/block lists used by
    /// [`is_valid_with_stack_check`](Self::is_valid_with_stack_check).
    #[must_use]
    pub fn call_stack(&self) -> &CallStackChecker {
        &self.call_stack
    }

    /// Start the integrity scan, random re-verification and continuous
    /// debugger checks on the current runtime.
    pub fn start(&self) {
        let security = self.secure.security().clone();
        self.runtime.start_periodic_check(security.integrity_interval);

        let weak: Weak<SecureClient> = Arc::downgrade(&self.secure);
        let interval = Interval::Random {
            min: security.random_verify_min,
            max: security.random_verify_max,
        };
        self.random_verify.start(interval, move || {
            let weak = weak.clone();
            async move {
                let Some(secure) = weak.upgrade() else {
                    return;
                };
                if !secure.is_valid().await {
                    debug!(category = "random_verify", "HardenedClient: re-verification failed");
                    secure.client().clear_cache();
                }
            }
        });

        self.anti_debug
            .start_continuous_check(security.anti_debug_interval, Arc::clone(&self.on_compromise));
        info!("HardenedClient: monitoring started");
    }

    /// Stop every background task.
    pub fn stop(&self) {
        self.anti_debug.stop();
        self.runtime.stop();
        self.random_verify.stop();
    }

    /// Stop monitoring and the client's heartbeat.
    pub fn close(&self) {
        self.stop();
        self.secure.close();
        debug!("HardenedClient: closed");
    }

    /// Whether a tamper detection flagged this session.
    #[must_use]
    pub fn is_compromised(&self) -> bool {
        self.compromised.load(Ordering::Acquire)
    }

    /// Verdict behind honeypot, rate and baseline checks.
    pub async fn is_valid(&self) -> bool {
        self.honeypot.record_call("is_valid");
        if self.is_compromised() || self.honeypot.is_compromised() {
            return false;
        }
        let limit = self.secure.security().max_calls_per_second;
        if !self.honeypot.check_call_frequency("is_valid", limit) {
            (self.on_compromise)("rate");
            return false;
        }

        let valid = self.secure.is_valid().await;
        *lock(&self.last_obfuscated) = Some(self.obfuscated.create_result(valid));
        lock(&self.verdict).set(valid);
        valid
    }

    /// Run [`is_valid`](Self::is_valid) and return the verdict in
    /// obfuscated form.
    pub async fn is_valid_obfuscated(&self) -> ObfuscatedResult {
        let valid = self.is_valid().await;
        lock(&self.last_obfuscated)
            .clone()
            .unwrap_or_else(|| self.obfuscated.create_result(valid))
    }

    /// Whether `result` is a fresh, untampered positive verdict.
    #[must_use]
    pub fn verify_obfuscated_result(&self, result: &ObfuscatedResult) -> bool {
        self.obfuscated.verify_result(result)
    }

    /// Token carrying the current verdict for `ttl_secs`.
    pub async fn validation_token(&self, ttl_secs: i64) -> ValidationToken {
        let valid = self.is_valid().await;
        self.obfuscated.create_token(valid, ttl_secs)
    }

    /// Whether `token` is an unexpired positive verdict.
    #[must_use]
    pub fn verify_validation_token(&self, token: &ValidationToken) -> bool {
        self.obfuscated.verify_token(token, true)
    }

    /// Verdict split into independently checkable tokens.
    ///
    /// Call sites should check different indices with
    /// [`verify_distributed_token`](Self::verify_distributed_token).
    pub async fn is_valid_distributed(&self) -> DistributedResult {
        if self.opaque.always_false() {
            return self.distributed.create_result(true);
        }
        if self.anti_debug.was_detected() {
            return self.distributed.create_result(false);
        }
        let valid = self.is_valid().await;
        let valid = self
            .opaque
            .confusing_branch(|| self.opaque.random_looking(valid));
        let result = self.distributed.create_result(valid);
        *lock(&self.last_distributed) = Some(result.clone());
        result
    }

    /// Check token `index` of `result`.
    #[must_use]
    pub fn verify_distributed_token(&self, result: &DistributedResult, index: usize) -> bool {
        if self.opaque.always_false() {
            return true;
        }
        self.distributed.verify_token(result, index)
    }

    /// Require an online verification before `feature` is granted.
    pub fn register_critical_feature(&self, feature: impl Into<String>) {
        self.critical_features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(feature.into());
    }

    fn is_critical(&self, feature: &str) -> bool {
        self.critical_features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(feature)
    }

    /// Feature check with online verification for critical features and
    /// two distributed tokens around the lookup.
    pub async fn has_feature_critical(&self, feature: &str) -> bool {
        if self.is_critical(feature) && !matches!(self.client().verify().await, Ok(true)) {
            return false;
        }
        let result = self.is_valid_distributed().await;
        if !self.verify_distributed_token(&result, 0) {
            return false;
        }
        if !self.client().has_feature(feature) {
            return false;
        }
        self.verify_distributed_token(&result, 1)
    }

    /// Verify online, then run `operation` between two token checks.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` if the server or a token refuses, a transport error
    /// from the verification, or the operation's own error.
    pub async fn execute_critical_operation<T, F, Fut>(&self, operation: F) -> Result<T, LicenseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LicenseError>>,
    {
        if !self.client().verify().await? {
            return Err(LicenseError::NotAuthorized);
        }
        let result = self.is_valid_distributed().await;
        if !self.verify_distributed_token(&result, 0) {
            return Err(LicenseError::NotAuthorized);
        }
        let outcome = operation().await;
        if !self.verify_distributed_token(&result, 2) {
            return Err(LicenseError::NotAuthorized);
        }
        outcome
    }

    /// Hold `pem` in the fragment protector and install it on the client.
    pub fn set_public_key_protected(&self, pem: &str) {
        self.key_protector.protect(pem);
        self.client().set_public_key(&self.key_protector.public_key());
    }

    /// Whether the protected key still matches `expected_tag`.
    #[must_use]
    pub fn verify_public_key(&self, expected_tag: &str) -> bool {
        self.key_protector.verify_integrity(expected_tag)
    }

    /// Answer a server challenge.
    ///
    /// # Errors
    ///
    /// `ChallengeExpired` if the challenge is past its expiry.
    pub fn solve_challenge(&self, challenge: &Challenge) -> Result<ChallengeAnswer, LicenseError> {
        self.challenge.solve(challenge)
    }

    /// [`is_valid`](Self::is_valid) after checking the caller's frames.
    pub async fn is_valid_with_stack_check(&self) -> bool {
        if !self.call_stack.check_caller(2) {
            (self.on_compromise)("call_stack");
            return false;
        }
        self.is_valid().await
    }

    /// Last verdict as held in the redundant store.
    #[must_use]
    pub fn protected_verdict(&self) -> bool {
        lock(&self.verdict).get()
    }

    /// Whether the redundant verdict store is consistent.
    #[must_use]
    pub fn check_protected_integrity(&self) -> bool {
        lock(&self.verdict).is_intact()
    }

    /// Feature check gated on [`is_valid`](Self::is_valid).
    pub async fn has_feature(&self, feature: &str) -> bool {
        self.is_valid().await && self.client().has_feature(feature)
    }

    /// Remaining days gated on [`is_valid`](Self::is_valid).
    pub async fn remaining_days(&self) -> i64 {
        if !self.is_valid().await {
            return 0;
        }
        self.client().remaining_days()
    }

    /// See [`LicenseClient::activate`].
    ///
    /// # Errors
    ///
    /// As [`LicenseClient::activate`].
    pub async fn activate(&self, license_key: &str) -> Result<AuthorizationRecord, LicenseError> {
        let record = self.client().activate(license_key).await?;
        self.clear_compromise();
        Ok(record)
    }

    /// See [`LicenseClient::login`].
    ///
    /// # Errors
    ///
    /// As [`LicenseClient::login`].
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthorizationRecord, LicenseError> {
        let record = self.client().login(email, password).await?;
        self.clear_compromise();
        Ok(record)
    }

    /// Drop tier-level detection state after a fresh online authorization.
    fn clear_compromise(&self) {
        self.compromised.store(false, Ordering::Release);
        self.honeypot.reset();
    }

    /// See [`LicenseClient::deactivate`].
    ///
    /// # Errors
    ///
    /// As [`LicenseClient::deactivate`].
    pub async fn deactivate(&self) -> Result<(), LicenseError> {
        self.client().deactivate().await
    }

    /// Current verdict and monitoring state.
    pub async fn security_status(&self) -> SecurityStatus {
        let is_valid = self.is_valid().await;
        SecurityStatus {
            is_valid,
            debugger_detected: self.anti_debug.was_detected(),
            public_key_protected: self.key_protector.is_protected(),
            has_validation_result: lock(&self.last_distributed).is_some(),
            critical_features_count: self
                .critical_features
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    #[doc(hidden)]
    pub fn license_key_internal(&self) -> String {
        self.honeypot.trigger_honeypot();
        String::new()
    }

    #[doc(hidden)]
    pub fn bypass_validation(&self) -> bool {
        self.honeypot.trigger_honeypot();
        false
    }

    #[doc(hidden)]
    pub fn set_valid_flag(&self, _valid: bool) {
        self.honeypot.trigger_honeypot();
    }

    #[doc(hidden)]
    pub fn unlock_premium(&self) -> bool {
        self.honeypot.trigger_honeypot();
        false
    }

    #[doc(hidden)]
    pub fn disable_license_check(&self) {
        self.honeypot.trigger_honeypot();
    }
}

impl Drop for HardenedClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HardenedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardenedClient")
            .field("secure", &self.secure)
            .field("compromised", &self.is_compromised())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler that flags the session and drops the cached credentials.
fn compromise_handler(client: &LicenseClient, flag: &Arc<AtomicBool>) -> DetectionHandler {
    let client = client.clone();
    let flag = Arc::clone(flag);
    Arc::new(move |category: &str| {
        flag.store(true, Ordering::Release);
        client.mark_compromised();
        debug!(category, "HardenedClient: session compromised");
    })
}

/// Entry points whose code is snapshotted for the integrity scan.
fn register_critical_functions(checker: &RuntimeIntegrityChecker) {
    type VerifyCached = fn(&SignatureVerifier, &AuthorizationRecord) -> Result<(), LicenseError>;
    type VerifyResult = fn(&ObfuscatedValidator, &ObfuscatedResult) -> bool;
    type VerifyToken = fn(&DistributedValidator, &DistributedResult, usize) -> bool;
    type HasFeature = fn(&AuthorizationRecord, &str) -> bool;

    let entries: [(&str, usize); 4] = [
        ("verify_cached", SignatureVerifier::verify_cached as VerifyCached as usize),
        ("verify_result", ObfuscatedValidator::verify_result as VerifyResult as usize),
        ("verify_token", DistributedValidator::verify_token as VerifyToken as usize),
        ("has_feature", AuthorizationRecord::has_feature as HasFeature as usize),
    ];
    for (name, entry) in entries {
        checker.register_function(name, entry);
    }
}
