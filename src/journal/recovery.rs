//! Terminal-failure recovery.
//!
//! A `failed` entry is not the end of the road: this maintenance phase
//! compares the authoritative local resource with the controller's view and
//! records a fresh compensating entry, then retires the failed one.

use crate::error::{DbError, Result};
use crate::journal::{self, store, EntryState, JournalEntry};
use crate::periodic::MaintenancePhase;
use crate::resources::{self, Operation, PluginRegistry};
use crate::transport::Transport;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct JournalRecovery {
    pool: SqlitePool,
    transport: Arc<dyn Transport>,
    registry: PluginRegistry,
}

impl JournalRecovery {
    pub fn new(pool: SqlitePool, transport: Arc<dyn Transport>, registry: PluginRegistry) -> Self {
        Self {
            pool,
            transport,
            registry,
        }
    }

    async fn recover_entry(&self, entry: &JournalEntry) -> Result<()> {
        let Some(plugin) = self.registry.get(entry.object_type) else {
            tracing::debug!(
                seqnum = entry.seqnum,
                object_type = entry.object_type.as_str(),
                "no plug-in registered, leaving failed entry alone"
            );
            return Ok(());
        };

        let local = plugin
            .get_resource(entry.object_type, &entry.object_uuid)
            .await?;
        let path = format!(
            "{}/{}",
            entry.object_type.collection_path(),
            entry.object_uuid
        );
        let on_controller = self.transport.resource_exists(&path).await?;

        let compensation = match (&local, on_controller) {
            // Both sides agree; only an update needs re-applying because its
            // payload never made it across.
            (Some(data), true) if entry.operation == Operation::Update => {
                Some((Operation::Update, data.clone()))
            }
            (Some(_), true) => None,
            (Some(data), false) => Some((Operation::Create, data.clone())),
            (None, true) => Some((Operation::Delete, json!([]))),
            (None, false) => None,
        };

        if let Some((operation, data)) = compensation {
            tracing::info!(
                seqnum = entry.seqnum,
                object_type = entry.object_type.as_str(),
                object_uuid = %entry.object_uuid,
                operation = operation.as_str(),
                "recording compensating entry for failed row"
            );
            journal::record(&self.pool, entry.object_type, &entry.object_uuid, operation, &data)
                .await?;
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        store::update_row_state(&mut conn, entry, EntryState::Completed).await?;
        // Entries queued behind the failed seqnum are still blocked on it;
        // drop the edges so they become runnable again.
        store::delete_dependencies_on(&mut conn, entry.seqnum).await?;
        Ok(())
    }
}

#[async_trait]
impl MaintenancePhase for JournalRecovery {
    fn name(&self) -> &'static str {
        "journal_recovery"
    }

    async fn run(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let failed = store::get_rows_by_state(&mut conn, EntryState::Failed).await?;
        drop(conn);

        for entry in &failed {
            // Relation entries have no authoritative resource to compare;
            // the router they belong to is recovered on its own.
            if entry.object_type == resources::ResourceType::RouterInterface {
                continue;
            }
            if let Err(err) = self.recover_entry(entry).await {
                tracing::warn!(
                    seqnum = entry.seqnum,
                    error = %err,
                    "failed to recover journal entry, will retry next cycle"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::resources::{ResourcePlugin, ResourceType};
    use crate::transport::{LightweightClient, Method};

    struct OnePort {
        port: Option<Value>,
    }

    #[async_trait]
    impl ResourcePlugin for OnePort {
        async fn get_resources(&self, _resource_type: ResourceType) -> Result<Vec<Value>> {
            Ok(self.port.clone().into_iter().collect())
        }

        async fn get_resource(
            &self,
            _resource_type: ResourceType,
            uuid: &str,
        ) -> Result<Option<Value>> {
            Ok(self
                .port
                .clone()
                .filter(|p| p.get("id").and_then(Value::as_str) == Some(uuid)))
        }
    }

    fn registry_with(port: Option<Value>) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(OnePort { port }), &[ResourceType::Port]);
        registry
    }

    async fn failed_port_entry(pool: &SqlitePool) -> JournalEntry {
        let entry = journal::record(
            pool,
            ResourceType::Port,
            "P1",
            Operation::Create,
            &json!({"id": "P1", "network_id": "N1"}),
        )
        .await
        .expect("record");

        let mut conn = pool.acquire().await.expect("conn");
        let claimed = store::claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("claimable");
        store::update_row_state(&mut conn, &claimed, EntryState::Failed)
            .await
            .expect("fail");
        store::get_row(&mut conn, entry.seqnum)
            .await
            .expect("fetch")
            .expect("entry exists")
    }

    #[tokio::test]
    async fn failed_create_with_local_resource_is_re_recorded() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let transport = Arc::new(LightweightClient::new());
        let entry = failed_port_entry(&pool).await;

        let phase = JournalRecovery::new(
            pool.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            registry_with(Some(json!({"id": "P1", "network_id": "N1"}))),
        );
        phase.run().await.expect("phase");

        let mut conn = pool.acquire().await.expect("conn");
        let original = store::get_row(&mut conn, entry.seqnum)
            .await
            .expect("fetch")
            .expect("entry exists");
        assert_eq!(original.state, EntryState::Completed);

        let pending = store::get_rows_by_state(&mut conn, EntryState::Pending)
            .await
            .expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].object_uuid, "P1");
        assert_eq!(pending[0].operation, Operation::Create);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn orphan_on_controller_gets_a_compensating_delete() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let transport = Arc::new(LightweightClient::new());
        transport
            .send_json(Method::Post, "ports", Some(&json!({"port": {"id": "P1"}})))
            .await
            .expect("seed controller");
        failed_port_entry(&pool).await;

        let phase = JournalRecovery::new(
            pool.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            registry_with(None),
        );
        phase.run().await.expect("phase");

        let mut conn = pool.acquire().await.expect("conn");
        let pending = store::get_rows_by_state(&mut conn, EntryState::Pending)
            .await
            .expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn gone_on_both_sides_just_retires_the_entry() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let transport = Arc::new(LightweightClient::new());
        let entry = failed_port_entry(&pool).await;

        let phase = JournalRecovery::new(
            pool.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            registry_with(None),
        );
        phase.run().await.expect("phase");

        let mut conn = pool.acquire().await.expect("conn");
        let original = store::get_row(&mut conn, entry.seqnum)
            .await
            .expect("fetch")
            .expect("entry exists");
        assert_eq!(original.state, EntryState::Completed);
        assert!(store::get_rows_by_state(&mut conn, EntryState::Pending)
            .await
            .expect("query")
            .is_empty());
    }

    #[tokio::test]
    async fn retiring_a_failed_entry_unblocks_its_dependents() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let transport = Arc::new(LightweightClient::new());

        // A subnet queued behind a network create that went terminal.
        journal::record(
            &pool,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
        )
        .await
        .expect("record network");
        journal::record(
            &pool,
            ResourceType::Subnet,
            "S1",
            Operation::Create,
            &json!({"id": "S1", "network_id": "N1"}),
        )
        .await
        .expect("record subnet");
        let mut conn = pool.acquire().await.expect("conn");
        let claimed = store::claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("network claimable");
        store::update_row_state(&mut conn, &claimed, EntryState::Failed)
            .await
            .expect("fail");
        drop(conn);

        // Network gone on both sides: the entry just retires.
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(OnePort { port: None }), &[ResourceType::Network]);
        let phase = JournalRecovery::new(
            pool.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            registry,
        );
        phase.run().await.expect("phase");

        let mut conn = pool.acquire().await.expect("conn");
        let next = store::claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("subnet runnable once the failed network retired");
        assert_eq!(next.object_uuid, "S1");
    }

    #[tokio::test]
    async fn failed_update_still_on_controller_is_re_recorded_as_update() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let transport = Arc::new(LightweightClient::new());
        transport
            .send_json(Method::Post, "ports", Some(&json!({"port": {"id": "P1"}})))
            .await
            .expect("seed controller");

        journal::record(
            &pool,
            ResourceType::Port,
            "P1",
            Operation::Update,
            &json!({"id": "P1", "name": "renamed"}),
        )
        .await
        .expect("record");
        let mut conn = pool.acquire().await.expect("conn");
        let claimed = store::claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("claimable");
        store::update_row_state(&mut conn, &claimed, EntryState::Failed)
            .await
            .expect("fail");
        drop(conn);

        let phase = JournalRecovery::new(
            pool.clone(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            registry_with(Some(json!({"id": "P1", "name": "renamed"}))),
        );
        phase.run().await.expect("phase");

        let mut conn = pool.acquire().await.expect("conn");
        let pending = store::get_rows_by_state(&mut conn, EntryState::Pending)
            .await
            .expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Update);
    }
}
