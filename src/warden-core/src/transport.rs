//! Transport seam between the license client and the server.
//!
//! Every endpoint answers with the envelope `{code, message, data}`;
//! `code == 0` is success. Transports return the unwrapped `data`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::LicenseError;

/// Request/response transport for the client API.
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    /// POST `body` as JSON to `endpoint` (relative to `/api/client`) and
    /// return the envelope's `data` object.
    async fn post(&self, endpoint: &str, body: Value) -> Result<Map<String, Value>, LicenseError>;

    /// GET `path` (relative to `/api/client`, query included) and return
    /// the envelope's `data` value.
    async fn get(&self, path: &str) -> Result<Value, LicenseError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

/// Decode a response envelope and return its `data`.
///
/// # Errors
///
/// `Api` for a non-zero code, `InvalidResponse` if the body is not an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Value, LicenseError> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| LicenseError::invalid_response(format!("not an API envelope: {e}")))?;
    if envelope.code != 0 {
        return Err(LicenseError::Api {
            code: envelope.code,
            message: envelope.message,
        });
    }
    Ok(envelope.data)
}

/// Interpret `data` as an object; `null` becomes an empty map.
///
/// # Errors
///
/// `InvalidResponse` if `data` is neither an object nor null.
pub fn data_object(data: Value) -> Result<Map<String, Value>, LicenseError> {
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(LicenseError::invalid_response(format!(
            "expected object data, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_success_envelope() {
        let data = decode_envelope(br#"{"code":0,"message":"ok","data":{"valid":true}}"#).unwrap();
        assert_eq!(data, json!({"valid": true}));
    }

    #[test]
    fn test_error_envelope() {
        let err = decode_envelope(br#"{"code":1001,"message":"license not found"}"#).unwrap_err();
        match err {
            LicenseError::Api { code, message } => {
                assert_eq!(code, 1001);
                assert_eq!(message, "license not found");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_garbage_body() {
        assert!(matches!(
            decode_envelope(b"<html>502</html>"),
            Err(LicenseError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_data_object() {
        assert!(data_object(Value::Null).unwrap().is_empty());
        assert!(data_object(json!([1, 2])).is_err());
    }
}
