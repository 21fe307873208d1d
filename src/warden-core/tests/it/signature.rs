//! Signature properties: canonical form, tamper detection and replay window.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use warden_core::{canonical_json, LicenseError, SignatureVerifier};

use crate::common::{now, public_key_pem, signed_at};

fn verifier() -> SignatureVerifier {
    SignatureVerifier::new(Some(&public_key_pem()), true, 300)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// Canonical bytes do not depend on insertion order.
    #[test]
    fn canonical_form_ignores_insertion_order(
        entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 1..12)
    ) {
        let build = |pairs: Vec<(&String, &i64)>| {
            let mut map = Map::new();
            for (k, v) in pairs {
                let mut nested = Map::new();
                nested.insert("n".into(), json!(v));
                nested.insert("a".into(), json!([k]));
                map.insert(k.clone(), Value::Object(nested));
            }
            map
        };
        let forward = build(entries.iter().collect());
        let backward = build(entries.iter().rev().collect());
        prop_assert_eq!(canonical_json(&forward).unwrap(), canonical_json(&backward).unwrap());
    }

    /// A signed payload verifies; changing any granted feature breaks it.
    #[test]
    fn altered_features_rejected(
        features in prop::collection::vec("[a-z]{1,10}", 0..6),
        extra in "[A-Z]{1,10}",
    ) {
        let payload = signed_at(json!({"valid": true, "device_id": "d", "features": features}), now());
        prop_assert!(verifier().verify_payload(&payload).is_ok());

        let mut altered = payload.clone();
        let mut list = features.clone();
        list.push(extra);
        altered.insert("features".into(), json!(list));
        prop_assert!(verifier().verify_payload(&altered).is_err());
    }
}

#[test]
fn test_signature_key_ignored_in_canonical_form() {
    let payload = signed_at(json!({"valid": true}), 1);
    let canonical = String::from_utf8(canonical_json(&payload).unwrap()).unwrap();
    assert_eq!(canonical, r#"{"timestamp":1,"valid":true}"#);
}

#[test]
fn test_no_html_escaping() {
    let map = json!({"note": "<a&b>"}).as_object().cloned().unwrap();
    let canonical = String::from_utf8(canonical_json(&map).unwrap()).unwrap();
    assert_eq!(canonical, r#"{"note":"<a&b>"}"#);
}

#[test]
fn test_replayed_response_rejected() {
    let stale = signed_at(json!({"valid": true}), now() - 600);
    assert!(matches!(
        verifier().verify_payload(&stale),
        Err(LicenseError::SignatureExpired { .. })
    ));
}

#[test]
fn test_foreign_key_rejected() {
    let payload = signed_at(json!({"valid": true}), now());
    let other = warden_crypto::RsaSigner::generate(1024).unwrap();
    let pem = warden_crypto::PayloadSigner::public_key_pem(&other).unwrap();
    let verifier = SignatureVerifier::new(Some(&pem), true, 300);
    assert!(matches!(
        verifier.verify_payload(&payload),
        Err(LicenseError::SignatureVerificationFailed { .. })
    ));
}

#[test]
fn test_garbage_signature_rejected() {
    let mut payload = signed_at(json!({"valid": true}), now());
    payload.insert("signature".into(), Value::String("%%%".into()));
    assert!(verifier().verify_payload(&payload).unwrap_err().is_signature_failure());
}
