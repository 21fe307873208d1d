//! License client flows against a scripted server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use warden_core::{
    hash_password, AuthorizationRecord, CacheStatus, CredentialStore, LicenseClient,
    LicenseConfig, LicenseError, LicenseState,
};

use crate::common::{
    license_payload, now, sign_record, signed, signed_config, MockTransport, APP_KEY, MACHINE_ID,
};

const DAY: i64 = 24 * 60 * 60;

fn client(config: LicenseConfig, transport: &Arc<MockTransport>) -> LicenseClient {
    LicenseClient::with_machine_id(config, transport.clone(), MACHINE_ID).unwrap()
}

/// Seed the cache with a signed record last verified `days_ago`.
fn seed(dir: &std::path::Path, days_ago: i64) {
    let mut record = AuthorizationRecord {
        valid: true,
        device_id: "dev-001".into(),
        expire_at: Some("2099-01-01T00:00:00Z".into()),
        features: vec!["export".into()],
        last_verified_at: now() - days_ago * DAY,
        ..AuthorizationRecord::default()
    };
    sign_record(&mut record);
    CredentialStore::new(dir, APP_KEY, MACHINE_ID, true)
        .save(&record)
        .unwrap();
}

#[tokio::test]
async fn test_activate_installs_verified_record() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    let client = client(signed_config(dir.path()), &transport);

    let record = client.activate("KEY-123").await.unwrap();
    assert!(record.valid);
    assert_eq!(record.license_key.as_deref(), Some("KEY-123"));
    assert!(client.has_feature("sync"));
    assert!(!client.has_feature("admin"));
    assert_eq!(client.remaining_days(), 365);
    assert_eq!(client.state(), LicenseState::Authenticated);
    assert_eq!(client.cache_status(), CacheStatus::Valid);
    assert!(client.is_heartbeat_running());

    let body = transport.last_body("/auth/activate").unwrap();
    assert_eq!(body["license_key"], "KEY-123");
    assert_eq!(body["machine_id"], MACHINE_ID);
    assert!(body["device_info"].is_object());
    client.close();
}

#[tokio::test]
async fn test_unsigned_activation_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let unsigned = license_payload(true).as_object().cloned().unwrap();
    transport.respond("/auth/activate", unsigned);
    let client = client(signed_config(dir.path()), &transport);

    let err = client.activate("KEY-123").await.unwrap_err();
    assert!(matches!(err, LicenseError::SignatureMissing));
    assert!(client.license_info().is_none());
    assert_eq!(client.cache_status(), CacheStatus::Missing);
    assert!(!client.is_valid().await);
}

#[tokio::test]
async fn test_api_error_surfaces_code() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.reject("/auth/activate", 4001, "license key not found");
    let client = client(signed_config(dir.path()), &transport);

    match client.activate("BAD").await {
        Err(LicenseError::Api { code, message }) => {
            assert_eq!(code, 4001);
            assert_eq!(message, "license key not found");
        },
        other => panic!("expected api error, got {other:?}"),
    }
    assert_eq!(client.state(), LicenseState::Unauthenticated);
}

#[tokio::test]
async fn test_login_sends_hashed_password() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/login", signed(license_payload(true)));
    let client = client(signed_config(dir.path()), &transport);

    let record = client.login("Alice@Example.com", "secret").await.unwrap();
    assert_eq!(record.email.as_deref(), Some("Alice@Example.com"));

    let body = transport.last_body("/auth/login").unwrap();
    assert_eq!(body["password"], hash_password("secret", "Alice@Example.com"));
    assert_eq!(body["password_hashed"], true);
    assert!(!body.to_string().contains("\"secret\""));
    client.close();
}

#[tokio::test]
async fn test_within_grace_stays_offline() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 6);
    let transport = MockTransport::new();
    let client = client(signed_config(dir.path()), &transport);

    assert!(client.is_valid().await);
    assert_eq!(transport.calls("/auth/verify"), 0);
}

#[tokio::test]
async fn test_grace_exceeded_verifies_online_once() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 8);
    let transport = MockTransport::new();
    transport.respond("/auth/verify", signed(json!({"valid": true})));
    let client = client(signed_config(dir.path()), &transport);
    assert_eq!(client.state(), LicenseState::OfflineExceeded);

    assert!(client.is_valid().await);
    assert_eq!(transport.calls("/auth/verify"), 1);

    assert!(client.is_valid().await);
    assert_eq!(transport.calls("/auth/verify"), 1);
    assert_eq!(client.state(), LicenseState::Authenticated);
}

#[tokio::test]
async fn test_grace_exceeded_and_offline_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 8);
    let transport = MockTransport::new();
    let client = client(signed_config(dir.path()), &transport);

    assert!(!client.is_valid().await);
    assert_eq!(transport.calls("/auth/verify"), 1);
}

#[tokio::test]
async fn test_forged_status_leaves_record_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 1);
    let transport = MockTransport::new();
    let mut forged = signed(json!({"valid": false}));
    forged.insert("valid".into(), Value::Bool(true));
    transport.respond("/auth/verify", forged);
    let client = client(signed_config(dir.path()), &transport);
    let before = client.license_info();

    assert!(client.verify().await.unwrap_err().is_signature_failure());
    assert_eq!(client.license_info(), before);
}

#[tokio::test]
async fn test_revocation_applies() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 1);
    let transport = MockTransport::new();
    transport.respond("/auth/verify", signed(json!({"valid": false})));
    let client = client(signed_config(dir.path()), &transport);

    assert!(!client.verify().await.unwrap());
    assert_eq!(client.state(), LicenseState::Unauthenticated);
    assert!(!client.is_valid().await);
}

#[tokio::test]
async fn test_expired_license_invalid_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let mut payload = license_payload(true);
    payload["expire_at"] = json!("2001-01-01T00:00:00Z");
    transport.respond("/auth/activate", signed(payload));
    let client = client(signed_config(dir.path()), &transport);

    client.activate("KEY-OLD").await.unwrap();
    assert_eq!(client.state(), LicenseState::Expired);
    assert!(!client.is_valid().await);
    assert_eq!(transport.calls("/auth/verify"), 0);
    client.close();
}

#[tokio::test]
async fn test_deactivate_clears_everything() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    transport.respond("/auth/deactivate", serde_json::Map::new());
    let client = client(signed_config(dir.path()), &transport);

    client.activate("KEY-123").await.unwrap();
    client.deactivate().await.unwrap();
    assert!(client.license_info().is_none());
    assert_eq!(client.cache_status(), CacheStatus::Missing);
    assert!(!client.is_heartbeat_running());
    assert!(!client.is_valid().await);
}

#[tokio::test]
async fn test_failed_deactivate_keeps_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    let client = client(signed_config(dir.path()), &transport);

    client.activate("KEY-123").await.unwrap();
    assert!(client.deactivate().await.is_err());
    assert!(client.license_info().is_some());
    client.close();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_runs_on_interval() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    let mut config = signed_config(dir.path());
    config.heartbeat_interval = Duration::from_secs(10);
    let client = client(config, &transport);

    client.activate("KEY-123").await.unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(transport.calls("/auth/heartbeat"), 3);

    client.close();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.calls("/auth/heartbeat"), 3);
}

#[tokio::test]
async fn test_check_update() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond_get(json!({
        "version": "2.1.0",
        "version_code": 210,
        "force_update": false,
        "changelog": "fixes",
    }));
    let client = client(signed_config(dir.path()), &transport);

    let update = client.check_update().await.unwrap();
    assert_eq!(update.version, "2.1.0");
    assert_eq!(update.version_code, 210);
    assert!(!update.force_update);
    assert_eq!(transport.calls(&format!("/releases/latest?app_key={APP_KEY}")), 1);
}

#[tokio::test]
async fn test_unsigned_mode_accepts_plain_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond(
        "/auth/activate",
        license_payload(true).as_object().cloned().unwrap(),
    );
    let config = LicenseConfig::new("https://license.test", APP_KEY).with_cache_dir(dir.path());
    let client = client(config, &transport);

    client.activate("KEY-123").await.unwrap();
    assert!(!client.is_signature_enabled());
    assert!(client.is_valid().await);
    client.close();
}
