//! The journal worker: drains pending entries to the controller.
//!
//! One worker task per process. A drain pass claims the oldest runnable
//! entry, re-validates its dependencies, shapes the payload, and dispatches
//! it. Connection failures reset the entry and abort the pass with a bounded
//! exponential backoff; HTTP rejections charge a retry against the entry.

use crate::config::OdlConfig;
use crate::error::{DbError, Result, TransportError};
use crate::filters;
use crate::journal::{self, dependencies, store, EntryState, JournalEntry};
use crate::resources::{self, Operation};
use crate::transport::{Method, Transport};

use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Why a drain pass stopped.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    /// Nothing runnable is left.
    Drained,
    /// The controller is unreachable; the in-flight entry was reset.
    ControllerUnreachable,
}

/// Long-running task that pushes journal entries to the controller.
pub struct JournalWorker {
    pool: SqlitePool,
    transport: Arc<dyn Transport>,
    sync_event: Arc<Notify>,
    sync_interval: Duration,
    retry_count: i64,
    completed_rows_retention: i64,
}

impl JournalWorker {
    pub fn new(pool: SqlitePool, transport: Arc<dyn Transport>, config: &OdlConfig) -> Self {
        Self {
            pool,
            transport,
            sync_event: Arc::new(Notify::new()),
            sync_interval: config.sync_interval(),
            retry_count: i64::from(config.retry_count),
            completed_rows_retention: config.completed_rows_retention,
        }
    }

    /// Handle used by recorders to wake the worker without waiting for the
    /// periodic tick.
    pub fn sync_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.sync_event)
    }

    /// Run until the stop channel flips. Finishes the in-flight dispatch
    /// before returning.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = BACKOFF_FLOOR;
        loop {
            match self.drain().await? {
                DrainOutcome::Drained => backoff = BACKOFF_FLOOR,
                DrainOutcome::ControllerUnreachable => {
                    tracing::warn!(?backoff, "controller unreachable, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop.changed() => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                }
            }

            if *stop.borrow() {
                tracing::info!("journal worker stopping");
                return Ok(());
            }

            tokio::select! {
                _ = self.sync_event.notified() => {}
                _ = tokio::time::sleep(self.sync_interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// One drain pass: dispatch runnable entries until none remain or the
    /// controller drops the connection.
    pub(crate) async fn drain(&self) -> Result<DrainOutcome> {
        let mut demoted: Option<i64> = None;
        loop {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            let Some(entry) = store::claim_oldest_runnable(&mut conn).await? else {
                return Ok(DrainOutcome::Drained);
            };

            if !dependencies::validate(&mut conn, &entry).await? {
                tracing::info!(
                    seqnum = entry.seqnum,
                    object_type = entry.object_type.as_str(),
                    object_uuid = %entry.object_uuid,
                    "dependencies not yet met, returning entry to the queue"
                );
                self.finish(&mut conn, &entry, Finish::Reset).await?;
                // Re-claiming the same entry straight after its reset means
                // nothing else is runnable; leave it for the next tick
                // instead of spinning on it.
                if demoted == Some(entry.seqnum) {
                    return Ok(DrainOutcome::Drained);
                }
                demoted = Some(entry.seqnum);
                continue;
            }

            match self.dispatch(&entry).await {
                Ok(()) => {
                    tracing::debug!(
                        seqnum = entry.seqnum,
                        object_type = entry.object_type.as_str(),
                        object_uuid = %entry.object_uuid,
                        operation = entry.operation.as_str(),
                        "entry synchronized"
                    );
                    self.finish(&mut conn, &entry, Finish::Complete).await?;
                }
                Err(err) if err.is_connection_error() => {
                    tracing::warn!(
                        seqnum = entry.seqnum,
                        error = %err,
                        "connection to the controller lost, resetting entry"
                    );
                    self.finish(&mut conn, &entry, Finish::Reset).await?;
                    return Ok(DrainOutcome::ControllerUnreachable);
                }
                Err(err) => {
                    tracing::warn!(
                        seqnum = entry.seqnum,
                        object_type = entry.object_type.as_str(),
                        object_uuid = %entry.object_uuid,
                        error = %err,
                        "controller rejected entry"
                    );
                    self.finish(&mut conn, &entry, Finish::Retry).await?;
                }
            }
        }
    }

    /// Send one entry over the wire. Delete is idempotent: an absent
    /// resource counts as success.
    async fn dispatch(&self, entry: &JournalEntry) -> std::result::Result<(), TransportError> {
        let path = resources::url_for(entry.object_type, &entry.object_uuid, entry.operation);

        match entry.operation {
            Operation::Delete => {
                self.transport.try_delete(&path).await?;
                Ok(())
            }
            Operation::Create | Operation::Update | Operation::Add | Operation::Remove => {
                let mut data = entry.data.clone();
                filters::filter_for_controller(entry.object_type, entry.operation, &mut data);

                let root = entry.object_type.as_str();
                let (method, body) = match entry.operation {
                    Operation::Create => (Method::Post, json!({ (root): data })),
                    Operation::Update => (Method::Put, json!({ (root): data })),
                    // Relation operations carry their payload bare.
                    _ => (Method::Put, data),
                };

                self.transport.send_json(method, &path, Some(&body)).await?;
                Ok(())
            }
        }
    }

    async fn finish(
        &self,
        conn: &mut sqlx::SqliteConnection,
        entry: &JournalEntry,
        finish: Finish,
    ) -> Result<()> {
        let result = match finish {
            Finish::Complete => {
                journal::entry_complete(conn, entry, self.completed_rows_retention).await
            }
            Finish::Reset => journal::entry_reset(conn, entry).await,
            Finish::Retry => journal::entry_retry(conn, entry, self.retry_count).await.map(|_| ()),
        };

        match result {
            Ok(()) => Ok(()),
            // A maintenance pass or a peer reset the row first; their write
            // stands.
            Err(DbError::StaleRow) => {
                tracing::debug!(seqnum = entry.seqnum, "entry mutated concurrently, skipping");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

enum Finish {
    Complete,
    Reset,
    Retry,
}
