use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;

use crate::error::RemoteError;
use crate::value::Record;

type HmacSha1 = Hmac<Sha1>;

/// Produces the authentication parameters every API request carries.
#[derive(Debug)]
pub struct RequestSigner {
    api_key: String,
    private_key: String,
    sequence: AtomicU64,
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            private_key: private_key.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// `<unix seconds>:<sequence>`, unique per signer.
    pub fn nonce(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{}", Utc::now().timestamp(), sequence)
    }

    /// Authentication parameters for a request carrying `params`.
    pub fn sign(&self, params: &Value) -> Result<Record, RemoteError> {
        let nonce = self.nonce();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let digest = self.digest(&nonce, &timestamp, params)?;

        let mut auth = Record::new();
        auth.insert("api_key".to_string(), Value::String(self.api_key.clone()));
        auth.insert("nonce".to_string(), Value::String(nonce));
        auth.insert("timestamp".to_string(), Value::String(timestamp));
        auth.insert("hmac_digest".to_string(), Value::String(digest));
        Ok(auth)
    }

    /// Hex HMAC-SHA1 over `nonce:timestamp:<json of stringified params>`.
    pub fn digest(&self, nonce: &str, timestamp: &str, params: &Value) -> Result<String, RemoteError> {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(self.private_key.as_bytes())
            .map_err(|_| RemoteError::NotConfigured("a usable private_key"))?;

        let payload = serde_json::to_string(&stringify(params)).map_err(|e| RemoteError::InvalidResponse {
            path: String::new(),
            reason: format!("could not encode request parameters: {}", e),
        })?;

        mac.update(nonce.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(payload.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Every leaf as a string, the way the API receives form parameters.
pub fn stringify(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), stringify(v))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(stringify).collect()),
        Value::Null => Value::String(String::new()),
        Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

/// Flattens nested parameters into `a[b]` / `a[]` query pairs.
pub fn flatten_params(params: &Record) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        flatten_into(key, value, &mut pairs);
    }
    pairs
}

fn flatten_into(key: &str, value: &Value, pairs: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(&format!("{}[{}]", key, k), v, pairs);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(&format!("{}[]", key), item, pairs);
            }
        }
        Value::Null => {}
        Value::String(s) => pairs.push((key.to_string(), s.clone())),
        other => pairs.push((key.to_string(), other.to_string())),
    }
}
