//! JSON-over-HTTP client with session reuse, basic auth, and timeouts.

use crate::config::OdlConfig;
use crate::error::TransportError;
use crate::transport::{Method, Transport};

use async_trait::async_trait;
use serde_json::Value;

/// Reusable controller session. Connection pooling lives inside the
/// wrapped `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestClient {
    pub fn new(config: &OdlConfig) -> Result<Self, TransportError> {
        Self::with_base_url(config, config.url.clone())
    }

    /// Client against a different base URL with the same credentials, used
    /// for RESTCONF endpoints outside the neutron northbound root.
    pub fn with_base_url(config: &OdlConfig, base_url: String) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Raw request, used directly by the WebSocket subscription which
    /// needs response headers.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.url(path);
        tracing::debug!(%method, %url, "sending controller request");

        let request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        let mut request = request.basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(TransportError::from)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Transport for RestClient {
    async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, TransportError> {
        let response = Self::check(self.request(method, path, body).await?).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        // Some controller endpoints answer 2xx with an empty body.
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if text.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, TransportError> {
        let response = self.request(Method::Get, path, None).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    async fn try_delete(&self, path: &str) -> Result<bool, TransportError> {
        let response = self.request(Method::Delete, path, None).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(path, "resource already absent, delete is a no-op");
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }
}
