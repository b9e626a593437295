//! HTTP transport to the controller.
//!
//! Two implementations: the real REST client and an in-memory lightweight
//! client selected by `enable_lightweight_testing`, which honors the same
//! URL grammar against a process-local resource map.

mod lightweight;
mod rest;

pub use lightweight::LightweightClient;
pub use rest::RestClient;

use crate::error::TransportError;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// The three verbs the journal dispatches with, plus GET for probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// JSON transport used by the worker, full-sync, and recovery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dispatch one request. 2xx is success; everything else surfaces as a
    /// classified [`TransportError`].
    async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, TransportError>;

    /// GET returning `None` on 404.
    async fn get(&self, path: &str) -> Result<Option<Value>, TransportError>;

    /// Idempotent DELETE: a 404 is success. Returns whether the resource
    /// was actually present.
    async fn try_delete(&self, path: &str) -> Result<bool, TransportError>;

    /// Whether a resource currently exists on the controller.
    async fn resource_exists(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self.get(path).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn lightweight_try_delete_swallows_missing_resources() {
        let client = LightweightClient::new();
        client
            .send_json(
                Method::Post,
                "networks",
                Some(&json!({"network": {"id": "N1", "name": "net1"}})),
            )
            .await
            .expect("create should succeed");

        assert!(client.try_delete("networks/N1").await.expect("delete"));
        // Second delete: resource already gone, still success.
        assert!(!client.try_delete("networks/N1").await.expect("delete"));
    }

    #[tokio::test]
    async fn lightweight_honors_offline_mode() {
        let client = LightweightClient::new();
        client.set_offline(true);

        let err = client
            .send_json(Method::Post, "networks", Some(&json!({"network": {"id": "N1"}})))
            .await
            .expect_err("offline client must fail");
        assert!(err.is_connection_error());

        client.set_offline(false);
        client
            .send_json(Method::Post, "networks", Some(&json!({"network": {"id": "N1"}})))
            .await
            .expect("back online");
        assert!(client.resource_exists("networks/N1").await.expect("probe"));
    }
}
