//! Full resynchronization against the canary probe.
//!
//! A reserved network on the controller acts as the canary: it is the last
//! entry recorded by a full sync, so its presence means the controller holds
//! a complete picture. When it disappears the controller lost its state and
//! everything is re-recorded from the authoritative plug-ins.

use crate::error::{DbError, Result};
use crate::journal::{self, store};
use crate::periodic::MaintenancePhase;
use crate::resources::{Operation, ResourceType};
use crate::transport::Transport;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Notify;

/// Reserved network id that marks a completed full sync.
pub const CANARY_NETWORK_ID: &str = "bd8db3a8-2b30-4083-a8b3-b3fd46401142";

pub struct FullSync {
    pool: SqlitePool,
    transport: Arc<dyn Transport>,
    registry: crate::resources::PluginRegistry,
    sync_event: Arc<Notify>,
}

impl FullSync {
    pub fn new(
        pool: SqlitePool,
        transport: Arc<dyn Transport>,
        registry: crate::resources::PluginRegistry,
        sync_event: Arc<Notify>,
    ) -> Self {
        Self {
            pool,
            transport,
            registry,
            sync_event,
        }
    }

    /// Full sync runs only when the canary is gone from the controller and
    /// no create for it is already queued.
    async fn full_sync_needed(&self) -> Result<bool> {
        let canary_path = format!(
            "{}/{}",
            ResourceType::Network.collection_path(),
            CANARY_NETWORK_ID
        );
        if self.transport.resource_exists(&canary_path).await? {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let queued = store::pending_or_processing_ops(
            &mut conn,
            CANARY_NETWORK_ID,
            Some(&[Operation::Create]),
        )
        .await?;
        Ok(queued.is_empty())
    }

    async fn resync(&self) -> Result<()> {
        // Pending creates and updates would re-issue against a controller
        // that lost everything; the re-enumeration below subsumes them.
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let purged =
            store::delete_pending_rows(&mut conn, &[Operation::Create, Operation::Update]).await?;
        drop(conn);
        tracing::info!(purged, "controller state lost, starting full sync");

        let mut recorded = 0u64;
        for resource_type in self.registry.registered_types() {
            let Some(plugin) = self.registry.get(resource_type) else {
                continue;
            };
            for resource in plugin.get_resources(resource_type).await? {
                let Some(uuid) = resource.get("id").and_then(Value::as_str) else {
                    tracing::warn!(
                        resource_type = resource_type.as_str(),
                        "skipping resource without an id"
                    );
                    continue;
                };
                let uuid = uuid.to_string();
                journal::record(
                    &self.pool,
                    resource_type,
                    &uuid,
                    Operation::Create,
                    &resource,
                )
                .await?;
                recorded += 1;
            }
        }

        // The canary goes last; its completion marks the sync as done.
        journal::record(
            &self.pool,
            ResourceType::Network,
            CANARY_NETWORK_ID,
            Operation::Create,
            &json!({
                "id": CANARY_NETWORK_ID,
                "tenant_id": CANARY_NETWORK_ID,
                "name": "Sync Canary Network",
                "admin_state_up": false,
            }),
        )
        .await?;

        tracing::info!(recorded, "full sync recorded, handing off to the worker");
        self.sync_event.notify_one();
        Ok(())
    }
}

#[async_trait]
impl MaintenancePhase for FullSync {
    fn name(&self) -> &'static str {
        "full_sync"
    }

    async fn run(&self) -> Result<()> {
        // With nothing to enumerate, a resync would purge queued work and
        // re-record nothing in its place.
        if self.registry.registered_types().next().is_none() {
            tracing::warn!("no resource plug-ins registered, skipping full sync");
            return Ok(());
        }
        if !self.full_sync_needed().await? {
            return Ok(());
        }
        self.resync().await
    }
}
