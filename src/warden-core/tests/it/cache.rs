//! Credential store properties: sealing, tamper response and age limits.

use std::fs;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proptest::prelude::*;
use warden_core::{
    AuthorizationRecord, CacheStatus, CredentialStore, LicenseError, SignatureVerifier,
    MAX_CACHE_AGE_SECS,
};

use crate::common::{now, public_key_pem, sign_record, APP_KEY, MACHINE_ID};

fn lax() -> SignatureVerifier {
    SignatureVerifier::new(None, false, 300)
}

fn strict() -> SignatureVerifier {
    SignatureVerifier::new(Some(&public_key_pem()), true, 300)
}

fn record(features: Vec<String>, remaining_days: i64) -> AuthorizationRecord {
    AuthorizationRecord {
        valid: true,
        license_id: Some("lic-001".into()),
        device_id: "dev-001".into(),
        remaining_days,
        features,
        last_verified_at: now(),
        ..Default::default()
    }
}

fn store(dir: &std::path::Path) -> CredentialStore {
    CredentialStore::new(dir, APP_KEY, MACHINE_ID, true)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// Whatever is saved loads back unchanged.
    #[test]
    fn save_load_roundtrip(
        features in prop::collection::vec("[a-z_]{1,12}", 0..8),
        remaining_days in 0i64..10_000,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = record(features, remaining_days);
        store.save(&record).unwrap();
        prop_assert_eq!(store.load(&lax()), Some(record));
    }

    /// Flipping any single bit of the stored blob makes the load fail and
    /// deletes the file.
    #[test]
    fn single_bit_tamper_rejected(position in any::<prop::sample::Index>(), bit in 0u8..8) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save(&record(vec!["export".into()], 30)).unwrap();

        let mut raw = BASE64.decode(fs::read(store.path()).unwrap()).unwrap();
        let i = position.index(raw.len());
        raw[i] ^= 1 << bit;
        fs::write(store.path(), BASE64.encode(raw)).unwrap();

        prop_assert_eq!(store.load(&lax()), None);
        prop_assert!(!store.path().exists());
    }
}

#[test]
fn test_age_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let now = now();

    store
        .save_at(&record(vec![], 1), now - MAX_CACHE_AGE_SECS + 60)
        .unwrap();
    assert!(store.load_at(&lax(), now).is_ok());

    store
        .save_at(&record(vec![], 1), now - 31 * 24 * 60 * 60)
        .unwrap();
    assert!(matches!(
        store.load_at(&lax(), now),
        Err(LicenseError::CacheExpired)
    ));
    assert!(!store.path().exists());
}

#[test]
fn test_signed_record_survives_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let mut signed = record(vec!["export".into()], 30);
    sign_record(&mut signed);
    store.save(&signed).unwrap();
    assert_eq!(store.inspect(&strict()), CacheStatus::Valid);
    assert_eq!(store.load(&strict()), Some(signed));
}

#[test]
fn test_forged_record_rejected_under_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let mut forged = record(vec!["export".into()], 30);
    sign_record(&mut forged);
    forged.features.push("admin".into());
    store.save(&forged).unwrap();

    assert_eq!(store.inspect(&strict()), CacheStatus::Tampered);
    assert!(store.load_checked(&strict()).unwrap_err().is_signature_failure());
    assert!(!store.path().exists());
}

#[test]
fn test_signed_legacy_cache_migrated() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let mut legacy = record(vec!["sync".into()], 10);
    sign_record(&mut legacy);
    fs::write(store.legacy_path(), serde_json::to_vec(&legacy).unwrap()).unwrap();

    assert_eq!(store.load(&strict()), Some(legacy));
    assert!(!store.legacy_path().exists());
    assert!(store.path().exists());
}

#[test]
fn test_cache_bound_to_app_key() {
    let dir = tempfile::tempdir().unwrap();
    store(dir.path()).save(&record(vec![], 1)).unwrap();
    let other = CredentialStore::new(dir.path(), "other-app", MACHINE_ID, true);
    assert_eq!(other.inspect(&lax()), CacheStatus::Missing);
}
