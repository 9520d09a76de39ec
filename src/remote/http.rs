use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::signing::{flatten_params, RequestSigner};
use super::{singular_resource_name, RemoteClient, RemoteRecord, RemoteResponse};
use crate::config::ApiConfig;
use crate::error::RemoteError;
use crate::value::Record;

/// Signed JSON-over-HTTP client for the Clearinghouse API.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    version: String,
    signer: RequestSigner,
}

impl HttpRemoteClient {
    /// Creates a client from config.
    ///
    /// Returns an error if the API URL or credentials are missing.
    pub fn from_config(config: &ApiConfig) -> Result<Self, RemoteError> {
        let base_url = config.base_url.clone().ok_or(RemoteError::NotConfigured("api.base_url"))?;
        let api_key = config.api_key.clone().ok_or(RemoteError::NotConfigured("api.api_key"))?;
        let private_key = config
            .private_key
            .clone()
            .ok_or(RemoteError::NotConfigured("api.private_key"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            version: config.version.clone(),
            signer: RequestSigner::new(api_key, private_key),
        })
    }

    /// `<base_url>/<version>/<path>`
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.version.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn request(&self, method: Method, path: &str, params: &Record) -> Result<Value, RemoteError> {
        let url = self.url(path);
        tracing::debug!(method = %method, url = %url, "Clearinghouse request");

        let builder = if method == Method::GET {
            let params_value = Value::Object(params.clone());
            let mut query = flatten_params(&self.signer.sign(&params_value)?);
            query.extend(flatten_params(params));
            self.client.get(&url).query(&query)
        } else {
            let name = singular_resource_name(path).ok_or_else(|| RemoteError::InvalidResponse {
                path: path.to_string(),
                reason: "cannot derive a resource name from the path".to_string(),
            })?;
            let mut payload = Record::new();
            payload.insert(name, Value::Object(params.clone()));
            let auth = self.signer.sign(&Value::Object(payload.clone()))?;
            payload.extend(auth);
            self.client.request(method.clone(), &url).json(&payload)
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(RemoteError::Status {
                method: method_name(&method),
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

fn method_name(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        _ => "HTTP",
    }
}

fn single(path: &str, body: Value) -> Result<RemoteRecord, RemoteError> {
    match RemoteResponse::from_json(path, body)? {
        RemoteResponse::One(record) => Ok(record),
        RemoteResponse::Many(_) => Err(RemoteError::InvalidResponse {
            path: path.to_string(),
            reason: "expected a single record, got a list".to_string(),
        }),
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn get(&self, path: &str, query: &Record) -> Result<RemoteResponse, RemoteError> {
        let body = self.request(Method::GET, path, query).await?;
        RemoteResponse::from_json(path, body)
    }

    async fn post(&self, path: &str, body: &Record) -> Result<RemoteRecord, RemoteError> {
        let response = self.request(Method::POST, path, body).await?;
        single(path, response)
    }

    async fn put(&self, path: &str, body: &Record) -> Result<RemoteRecord, RemoteError> {
        let response = self.request(Method::PUT, path, body).await?;
        single(path, response)
    }
}
