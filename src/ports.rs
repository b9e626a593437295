//! Port operational-status reconciliation.
//!
//! The controller reports port state asynchronously over the change stream.
//! When a port goes ACTIVE the orchestrator-side provisioning barrier is
//! released through the plug-in registry. Deleted events carry no status and
//! are ignored.

use crate::error::Result;
use crate::resources::{PluginRegistry, ResourceType};
use crate::transport::Transport;
use crate::websocket::{extract_field, ChangeEvent, EventOperation, StreamMessage};

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

const UUID_KEY: &str = "neutron:uuid";
const STATUS_ACTIVE: &str = "ACTIVE";

/// Consumes stream messages and applies port status to the orchestrator.
pub struct PortStatusHandler {
    registry: PluginRegistry,
    transport: Arc<dyn Transport>,
}

impl PortStatusHandler {
    pub fn new(registry: PluginRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Drive the handler from the receiver's channel until it closes.
    pub async fn run(&self, mut messages: mpsc::Receiver<StreamMessage>) -> Result<()> {
        while let Some(message) = messages.recv().await {
            match message {
                StreamMessage::Connected => {
                    if let Err(err) = self.sweep_down_ports().await {
                        tracing::warn!(error = %err, "down-port sweep failed");
                    }
                }
                StreamMessage::Change(event) => {
                    if let Err(err) = self.handle_event(&event).await {
                        tracing::warn!(error = %err, "port status event failed");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<()> {
        if event.operation == EventOperation::Deleted {
            return Ok(());
        }
        let Some(port_id) = extract_field(&event.path, UUID_KEY) else {
            tracing::debug!(path = %event.path, "change event without a port uuid");
            return Ok(());
        };
        if !status_is_active(&event.data) {
            return Ok(());
        }
        self.complete_provisioning(&port_id).await
    }

    /// A socket outage can swallow activation events; on reconnect, probe
    /// the controller for every port the orchestrator still considers down.
    async fn sweep_down_ports(&self) -> Result<()> {
        let Some(plugin) = self.registry.get(ResourceType::Port) else {
            return Ok(());
        };

        for port in plugin.get_down_ports().await? {
            let Some(port_id) = port.get("id").and_then(Value::as_str) else {
                continue;
            };
            let path = format!("{}/{}", ResourceType::Port.collection_path(), port_id);
            match self.transport.get(&path).await {
                Ok(Some(data)) if status_is_active(&data) => {
                    self.complete_provisioning(port_id).await?;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(port_id, error = %err, "port status probe failed");
                }
            }
        }
        Ok(())
    }

    async fn complete_provisioning(&self, port_id: &str) -> Result<()> {
        let Some(plugin) = self.registry.get(ResourceType::Port) else {
            return Ok(());
        };
        tracing::info!(port_id, "port reported active, completing provisioning");
        plugin.provisioning_complete(port_id).await
    }
}

/// Status arrives either as a plain string or wrapped in a YANG-JSON
/// `{"content": ...}` leaf.
fn status_is_active(data: &Value) -> bool {
    let status = data.get("status").unwrap_or(data);
    match status {
        Value::String(s) => s == STATUS_ACTIVE,
        Value::Object(_) => status.get("content").and_then(Value::as_str) == Some(STATUS_ACTIVE),
        _ => false,
    }
}
