//! Shared fixtures: a scripted transport and a once-generated server key.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};
use warden_core::{canonical_json, AuthorizationRecord, LicenseConfig, LicenseError, LicenseTransport};
use warden_crypto::{PayloadSigner, RsaSigner};

pub const MACHINE_ID: &str = "0123456789abcdef0123456789abcdef";
pub const APP_KEY: &str = "app-test";

/// Server signing key, generated once per test binary.
pub fn signer() -> &'static RsaSigner {
    static SIGNER: OnceLock<RsaSigner> = OnceLock::new();
    SIGNER.get_or_init(|| RsaSigner::generate(1024).unwrap())
}

pub fn public_key_pem() -> String {
    signer().public_key_pem().unwrap()
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

pub fn sign_map(map: &Map<String, Value>) -> String {
    BASE64.encode(signer().sign(&canonical_json(map).unwrap()).unwrap())
}

/// Stamp `payload` with the current time and sign it.
pub fn signed(payload: Value) -> Map<String, Value> {
    signed_at(payload, now())
}

pub fn signed_at(payload: Value, timestamp: i64) -> Map<String, Value> {
    let mut map = object(payload);
    map.insert("timestamp".into(), Value::from(timestamp));
    let signature = sign_map(&map);
    map.insert("signature".into(), Value::String(signature));
    map
}

/// Sign a record the way the server would have, for seeding caches.
pub fn sign_record(record: &mut AuthorizationRecord) {
    record.signed_at.get_or_insert(now());
    record.signature = Some(sign_map(&record.signed_fields()));
}

/// Config enforcing signatures against the test key.
pub fn signed_config(dir: &Path) -> LicenseConfig {
    LicenseConfig::new("https://license.test", APP_KEY)
        .with_cache_dir(dir)
        .with_server_public_key(public_key_pem())
}

pub fn license_payload(valid: bool) -> Value {
    serde_json::json!({
        "valid": valid,
        "license_id": "lic-001",
        "device_id": "dev-001",
        "type": "pro",
        "expire_at": "2099-01-01T00:00:00Z",
        "remaining_days": 365,
        "features": ["export", "sync"],
    })
}

enum Reply {
    Data(Map<String, Value>),
    Api(i64, &'static str),
}

/// Transport answering from per-endpoint queues. An empty queue behaves
/// like an unreachable server.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<(String, Value)>>,
    get_reply: Mutex<Option<Value>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, endpoint: &str, data: Map<String, Value>) {
        self.push(endpoint, Reply::Data(data));
    }

    pub fn reject(&self, endpoint: &str, code: i64, message: &'static str) {
        self.push(endpoint, Reply::Api(code, message));
    }

    pub fn respond_get(&self, data: Value) {
        *self.get_reply.lock().unwrap() = Some(data);
    }

    fn push(&self, endpoint: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .count()
    }

    pub fn last_body(&self, endpoint: &str) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(e, _)| e == endpoint)
            .map(|(_, body)| body.clone())
    }
}

#[async_trait]
impl LicenseTransport for MockTransport {
    async fn post(&self, endpoint: &str, body: Value) -> Result<Map<String, Value>, LicenseError> {
        self.requests
            .lock()
            .unwrap()
            .push((endpoint.to_string(), body));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Reply::Data(data)) => Ok(data),
            Some(Reply::Api(code, message)) => Err(LicenseError::Api {
                code,
                message: message.to_string(),
            }),
            None => Err(LicenseError::network("server unreachable")),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, LicenseError> {
        self.requests
            .lock()
            .unwrap()
            .push((path.to_string(), Value::Null));
        self.get_reply
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LicenseError::network("server unreachable"))
    }
}
