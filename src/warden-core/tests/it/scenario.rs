//! End-to-end runs across process restarts and through the hardened tier.

use std::sync::Arc;

use serde_json::json;
use warden_core::security::anti_debug::Probe;
use warden_core::security::{AntiDebug, NoopIntrospector};
use warden_core::{
    CacheStatus, CredentialStore, HardenedClient, LicenseClient, LicenseError, LicenseState,
    SecurityConfig,
};

use crate::common::{
    license_payload, public_key_pem, signed, signed_config, MockTransport, APP_KEY, MACHINE_ID,
};

fn quiet_anti_debug() -> Arc<AntiDebug> {
    let probes: Vec<Probe> = vec![Box::new(|| false), Box::new(|| false)];
    Arc::new(AntiDebug::with_probes(probes))
}

fn relaxed() -> SecurityConfig {
    SecurityConfig {
        max_calls_per_second: f64::INFINITY,
        ..SecurityConfig::default()
    }
}

#[tokio::test]
async fn test_activation_survives_restart_offline() {
    let dir = tempfile::tempdir().unwrap();
    {
        let transport = MockTransport::new();
        transport.respond("/auth/activate", signed(license_payload(true)));
        let client =
            LicenseClient::with_machine_id(signed_config(dir.path()), transport, MACHINE_ID)
                .unwrap();
        client.activate("KEY-123").await.unwrap();
        client.close();
    }

    let offline = MockTransport::new();
    let client =
        LicenseClient::with_machine_id(signed_config(dir.path()), offline.clone(), MACHINE_ID)
            .unwrap();
    assert!(client.is_valid().await);
    assert!(client.has_feature("export"));
    assert_eq!(client.license_info().unwrap().license_key.as_deref(), Some("KEY-123"));
    assert_eq!(offline.calls("/auth/verify"), 0);
}

#[tokio::test]
async fn test_corrupted_cache_starts_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    let client =
        LicenseClient::with_machine_id(signed_config(dir.path()), transport, MACHINE_ID).unwrap();
    client.activate("KEY-123").await.unwrap();
    client.close();

    let store = CredentialStore::new(dir.path(), APP_KEY, MACHINE_ID, true);
    let mut bytes = std::fs::read(store.path()).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x20;
    std::fs::write(store.path(), bytes).unwrap();

    let restarted =
        LicenseClient::with_machine_id(signed_config(dir.path()), MockTransport::new(), MACHINE_ID)
            .unwrap();
    assert_eq!(restarted.state(), LicenseState::Unauthenticated);
    assert!(!restarted.is_valid().await);
    assert_eq!(restarted.cache_status(), CacheStatus::Missing);
}

#[tokio::test]
async fn test_cache_does_not_open_on_another_machine() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    let client =
        LicenseClient::with_machine_id(signed_config(dir.path()), transport, MACHINE_ID).unwrap();
    client.activate("KEY-123").await.unwrap();
    client.close();

    let elsewhere = LicenseClient::with_machine_id(
        signed_config(dir.path()),
        MockTransport::new(),
        "fedcba9876543210fedcba9876543210",
    )
    .unwrap();
    assert!(elsewhere.license_info().is_none());
    assert!(!elsewhere.is_valid().await);
}

#[tokio::test]
async fn test_hardened_tier_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    transport.respond("/auth/verify", signed(json!({"valid": true})));
    let client =
        LicenseClient::with_machine_id(signed_config(dir.path()), transport.clone(), MACHINE_ID)
            .unwrap();
    let hardened = HardenedClient::with_components(
        client,
        relaxed(),
        quiet_anti_debug(),
        Arc::new(NoopIntrospector),
    );
    hardened.set_public_key_protected(&public_key_pem());
    hardened.register_critical_feature("export");

    hardened.activate("KEY-123").await.unwrap();
    assert!(hardened.is_valid().await);
    assert!(hardened.has_feature_critical("export").await);
    assert_eq!(transport.calls("/auth/verify"), 1);

    let token = hardened.validation_token(60).await;
    assert!(hardened.verify_validation_token(&token));

    let status = hardened.security_status().await;
    assert!(status.is_valid);
    assert!(!status.debugger_detected);
    assert!(status.public_key_protected);
    assert!(status.has_validation_result);
    assert_eq!(status.critical_features_count, 1);

    // Critical feature with the server unreachable.
    assert!(!hardened.has_feature_critical("export").await);

    assert!(!hardened.unlock_premium());
    assert!(hardened.is_compromised());
    assert_eq!(hardened.client().state(), LicenseState::Compromised);
    assert!(!hardened.is_valid().await);
    assert!(hardened.client().license_info().is_none());
    hardened.close();
}

#[tokio::test]
async fn test_critical_operation_requires_server() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.respond("/auth/activate", signed(license_payload(true)));
    transport.respond("/auth/verify", signed(json!({"valid": true})));
    transport.respond("/auth/verify", signed(json!({"valid": false})));
    let client =
        LicenseClient::with_machine_id(signed_config(dir.path()), transport.clone(), MACHINE_ID)
            .unwrap();
    let hardened = HardenedClient::with_components(
        client,
        relaxed(),
        quiet_anti_debug(),
        Arc::new(NoopIntrospector),
    );
    hardened.activate("KEY-123").await.unwrap();

    let value = hardened
        .execute_critical_operation(|| async { Ok::<_, LicenseError>(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);

    let refused = hardened
        .execute_critical_operation(|| async { Ok::<_, LicenseError>(7) })
        .await;
    assert!(matches!(refused, Err(LicenseError::NotAuthorized)));

    let offline = hardened
        .execute_critical_operation(|| async { Ok::<_, LicenseError>(0) })
        .await;
    assert!(offline.unwrap_err().is_retryable());
    hardened.close();
}
