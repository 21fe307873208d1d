//! License data model: the authorization record and request/response payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Locally held authorization decision.
///
/// Built from a verified server payload and persisted by the
/// [`CredentialStore`](crate::cache::CredentialStore).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    /// Server verdict.
    pub valid: bool,
    /// License identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    /// Subscription identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Device identifier assigned by the server.
    #[serde(default)]
    pub device_id: String,
    /// License type label.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub license_type: Option<String>,
    /// Plan label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,
    /// Expiry, RFC3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<String>,
    /// Days until expiry as reported by the server.
    #[serde(default)]
    pub remaining_days: i64,
    /// Granted feature identifiers, in server order.
    #[serde(default)]
    pub features: Vec<String>,
    /// Base64 RSA signature over the canonical payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// License key used for activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    /// Account email used for login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Unix seconds of the last successful online verification.
    #[serde(default)]
    pub last_verified_at: i64,
    /// `timestamp` carried by the signed payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<i64>,
}

impl AuthorizationRecord {
    /// Build a record from a server payload.
    ///
    /// Fields with unexpected types are ignored, matching the server's
    /// loose typing.
    #[must_use]
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let string = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            valid: payload.get("valid").and_then(Value::as_bool).unwrap_or(false),
            license_id: string("license_id"),
            subscription_id: string("subscription_id"),
            device_id: string("device_id").unwrap_or_default(),
            license_type: string("type"),
            plan_type: string("plan_type"),
            expire_at: string("expire_at"),
            remaining_days: payload.get("remaining_days").and_then(json_i64).unwrap_or(0),
            features: payload
                .get("features")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            signature: string("signature").filter(|s| !s.is_empty()),
            license_key: None,
            email: None,
            last_verified_at: 0,
            signed_at: payload.get("timestamp").and_then(json_i64),
        }
    }

    /// Replace the server-derived fields with those of `fresh`, keeping
    /// the locally supplied license key and email.
    pub fn refresh_from(&mut self, fresh: Self) {
        let license_key = self.license_key.take();
        let email = self.email.take();
        *self = Self {
            license_key,
            email,
            ..fresh
        };
    }

    /// The fields covered by the server signature, as a JSON map.
    ///
    /// Used to re-verify a cached record offline.
    #[must_use]
    pub fn signed_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("valid".into(), Value::Bool(self.valid));
        map.insert("device_id".into(), Value::String(self.device_id.clone()));
        map.insert("remaining_days".into(), Value::from(self.remaining_days));
        map.insert(
            "features".into(),
            Value::Array(self.features.iter().cloned().map(Value::String).collect()),
        );
        let optional = [
            ("license_id", &self.license_id),
            ("subscription_id", &self.subscription_id),
            ("type", &self.license_type),
            ("plan_type", &self.plan_type),
            ("expire_at", &self.expire_at),
        ];
        for (key, value) in optional {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                map.insert(key.into(), Value::String(v.clone()));
            }
        }
        if let Some(ts) = self.signed_at {
            map.insert("timestamp".into(), Value::from(ts));
        }
        map
    }

    /// Whether the record grants `feature`.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Integer view of a JSON number that may have been encoded as a float.
pub(crate) fn json_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

/// Device description sent on activation and login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Display name.
    pub name: String,
    /// Host name.
    pub hostname: String,
    /// OS label.
    pub os: String,
    /// OS version label.
    pub os_version: String,
    /// Application version.
    pub app_version: String,
}

impl DeviceInfo {
    /// Describe the current machine.
    #[must_use]
    pub fn current(app_version: &str) -> Self {
        let hostname = crate::fingerprint::hostname();
        Self {
            name: hostname.clone(),
            hostname,
            os: crate::fingerprint::os_label().to_string(),
            os_version: crate::fingerprint::arch_label().to_string(),
            app_version: app_version.to_string(),
        }
    }
}

/// Latest release metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateInfo {
    /// Version string.
    pub version: String,
    /// Monotonic version code.
    pub version_code: i64,
    /// Download URL.
    pub download_url: String,
    /// Release notes.
    pub changelog: String,
    /// Size in bytes.
    pub file_size: i64,
    /// Hex SHA-256 of the artifact.
    pub file_hash: String,
    /// Whether the update is mandatory.
    pub force_update: bool,
}
