//! In-memory transport for lightweight testing.
//!
//! Keeps a process-local map of resources keyed by their URL path and
//! honors the same grammar the REST client uses. Tests can flip it
//! offline to simulate an unreachable controller or inject one HTTP
//! failure to exercise the retry policy.

use crate::error::TransportError;
use crate::transport::{Method, Transport};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    resources: BTreeMap<String, Value>,
    fail_next: Vec<u16>,
}

/// In-memory stand-in for the controller.
#[derive(Default)]
pub struct LightweightClient {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl LightweightClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable controller: every request fails with a
    /// connection error until flipped back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queue an HTTP error status for the next dispatch.
    pub fn fail_next_with_status(&self, status: u16) {
        self.inner
            .lock()
            .expect("lightweight lock poisoned")
            .fail_next
            .push(status);
    }

    /// Direct store access for test assertions.
    pub fn stored(&self, path: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("lightweight lock poisoned")
            .resources
            .get(path)
            .cloned()
    }

    /// Number of stored resources under a collection prefix.
    pub fn count_in(&self, collection: &str) -> usize {
        let prefix = format!("{collection}/");
        self.inner
            .lock()
            .expect("lightweight lock poisoned")
            .resources
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    /// Remove a resource behind the journal's back, simulating
    /// controller-side state loss.
    pub fn remove(&self, path: &str) {
        self.inner
            .lock()
            .expect("lightweight lock poisoned")
            .resources
            .remove(path);
    }

    fn gate(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "lightweight transport is offline".to_string(),
            ));
        }
        let mut inner = self.inner.lock().expect("lightweight lock poisoned");
        if let Some(status) = inner.fail_next.pop() {
            return Err(TransportError::Http {
                status,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Pull the payload out of its `{singular: {...}}` wrapper.
    fn unwrap_root(body: &Value) -> Value {
        body.as_object()
            .and_then(|o| o.values().next())
            .cloned()
            .unwrap_or_else(|| body.clone())
    }
}

#[async_trait]
impl Transport for LightweightClient {
    async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, TransportError> {
        self.gate()?;
        let mut inner = self.inner.lock().expect("lightweight lock poisoned");

        match method {
            Method::Post => {
                let payload = body.map(Self::unwrap_root).unwrap_or(Value::Null);
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TransportError::InvalidResponse("create payload without id".to_string())
                    })?
                    .to_string();
                inner.resources.insert(format!("{path}/{id}"), payload);
                Ok(None)
            }
            Method::Put => {
                // Relation operations target an action path; record the
                // payload there so tests can observe it.
                let payload = body.map(Self::unwrap_root).unwrap_or(Value::Null);
                inner.resources.insert(path.to_string(), payload);
                Ok(None)
            }
            Method::Delete => {
                if inner.resources.remove(path).is_none() {
                    return Err(TransportError::Http {
                        status: 404,
                        body: String::new(),
                    });
                }
                Ok(None)
            }
            Method::Get => Ok(inner.resources.get(path).cloned()),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, TransportError> {
        self.gate()?;
        let inner = self.inner.lock().expect("lightweight lock poisoned");
        Ok(inner.resources.get(path).cloned())
    }

    async fn try_delete(&self, path: &str) -> Result<bool, TransportError> {
        self.gate()?;
        let mut inner = self.inner.lock().expect("lightweight lock poisoned");
        Ok(inner.resources.remove(path).is_some())
    }
}
