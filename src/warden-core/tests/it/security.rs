//! Tamper-resistance primitives exercised through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use warden_core::security::distributed::TOKEN_COUNT;
use warden_core::security::{
    DistributedValidator, HoneypotDetector, ObfuscatedValidator, ProtectedBool,
    PublicKeyProtector, TimeChecker,
};

use crate::common::{public_key_pem, APP_KEY, MACHINE_ID};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// Every token of a valid result verifies, none of an invalid one does,
    /// and indices past the end never verify.
    #[test]
    fn distributed_tokens(valid in any::<bool>(), index in 0usize..TOKEN_COUNT + 4) {
        let validator = DistributedValidator::new(MACHINE_ID, APP_KEY);
        let result = validator.create_result(valid);
        let expected = valid && index < TOKEN_COUNT;
        prop_assert_eq!(validator.verify_token(&result, index), expected);
    }

    /// Obfuscated tokens assert exactly the verdict they were minted with.
    #[test]
    fn obfuscated_token_asserts_one_verdict(valid in any::<bool>(), secret in prop::collection::vec(any::<u8>(), 1..48)) {
        let validator = ObfuscatedValidator::new(&secret);
        let token = validator.create_token(valid, 60);
        prop_assert!(validator.verify_token(&token, valid));
        prop_assert!(!validator.verify_token(&token, !valid));
    }

    /// Arbitrary key material survives fragmentation.
    #[test]
    fn key_protector_roundtrip(pem in "[ -~]{1,600}") {
        let protector = PublicKeyProtector::new(MACHINE_ID);
        protector.protect(&pem);
        let key = protector.public_key();
        prop_assert_eq!(key.as_str(), pem.as_str());
    }
}

#[test]
fn test_distributed_results_bound_to_machine() {
    let here = DistributedValidator::new(MACHINE_ID, APP_KEY);
    let elsewhere = DistributedValidator::new("ffffffffffffffffffffffffffffffff", APP_KEY);
    let result = here.create_result(true);
    assert!(here.verify_all(&result));
    assert!(!elsewhere.verify_all(&result));
}

#[test]
fn test_obfuscated_expired_token_rejected() {
    let validator = ObfuscatedValidator::new(b"session-secret");
    let token = validator.create_token(true, -1);
    assert!(!validator.verify_token(&token, true));
}

#[test]
fn test_key_protector_integrity_tag() {
    let protector = PublicKeyProtector::new(MACHINE_ID);
    assert!(protector.integrity_tag().is_none());
    protector.protect(&public_key_pem());
    let tag = protector.integrity_tag().unwrap();
    assert!(protector.verify_integrity(&tag));

    protector.protect("-----BEGIN PUBLIC KEY-----\nswapped\n-----END PUBLIC KEY-----");
    assert!(!protector.verify_integrity(&tag));
}

#[test]
fn test_time_rollback_detected_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let now = chrono::Utc::now().timestamp();

    let first = TimeChecker::with_host(dir.path(), "host-a", 300);
    assert!(first.check_at(now + 3600));
    assert!(first.path().exists());

    let second = TimeChecker::with_host(dir.path(), "host-a", 300);
    assert_eq!(second.last_seen(), now + 3600);
    assert!(second.check_at(now + 3600 - 200));
    assert!(!second.check_at(now));
}

#[test]
fn test_time_file_from_other_host_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let now = chrono::Utc::now().timestamp();
    TimeChecker::with_host(dir.path(), "host-a", 300).check_at(now + 3600);

    let other = TimeChecker::with_host(dir.path(), "host-b", 300);
    assert!(other.last_seen() < now + 3600);
    assert!(other.check_at(now));
}

#[test]
fn test_honeypot_notifies_handler() {
    let detector = HoneypotDetector::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    detector.set_detection_handler(Arc::new(move |category| {
        assert_eq!(category, "honeypot");
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(!detector.is_compromised());
    detector.trigger_honeypot();
    assert!(detector.is_compromised());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_protected_bool_tracks_value() {
    let mut flag = ProtectedBool::new(false);
    assert!(!flag.get());
    flag.set(true);
    assert!(flag.get());
    assert!(flag.is_intact());
}
