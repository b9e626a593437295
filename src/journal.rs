//! The durable journal: recording, claiming, and finishing entries.
//!
//! Every northbound change lands here first as a `pending` row inside the
//! caller's transaction, then the worker drains rows to the controller in
//! dependency order. The journal is the source of truth for what still has
//! to reach the controller; losing the controller only delays dispatch.

pub mod cleanup;
pub mod dependencies;
pub mod full_sync;
pub mod recovery;
pub mod store;
pub mod worker;

pub use store::{EntryState, JournalEntry};
pub use worker::JournalWorker;

use crate::error::DbError;
use crate::resources::{Operation, ResourceType};

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

/// Busy-retry ceiling for recording under contention.
const RECORD_ATTEMPTS: u32 = 3;

/// Record one operation as a pending journal entry, dependency edges
/// included.
///
/// For delete operations `data` is the JSON array of parent identifiers the
/// object referenced; for everything else it is the full resource payload.
/// Retried when SQLite reports contention or when a depended-on row was
/// purged mid-calculation.
pub async fn record(
    pool: &SqlitePool,
    object_type: ResourceType,
    object_uuid: &str,
    operation: Operation,
    data: &Value,
) -> Result<JournalEntry, DbError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_record(pool, object_type, object_uuid, operation, data).await {
            Ok(entry) => return Ok(entry),
            Err(err) if attempt < RECORD_ATTEMPTS && should_retry_record(&err) => {
                tracing::debug!(
                    object_type = object_type.as_str(),
                    object_uuid,
                    attempt,
                    error = %err,
                    "retrying journal record"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

fn should_retry_record(err: &DbError) -> bool {
    matches!(err, DbError::ReferenceError) || err.is_retriable()
}

async fn try_record(
    pool: &SqlitePool,
    object_type: ResourceType,
    object_uuid: &str,
    operation: Operation,
    data: &Value,
) -> Result<JournalEntry, DbError> {
    let mut tx = pool.begin().await?;
    let deps = dependencies::calculate(&mut tx, operation, object_type, object_uuid, data).await?;
    let entry =
        store::create_pending_row(&mut tx, object_type, object_uuid, operation, data, &deps)
            .await?;
    tx.commit().await?;

    tracing::debug!(
        seqnum = entry.seqnum,
        object_type = object_type.as_str(),
        object_uuid,
        operation = operation.as_str(),
        dependencies = deps.len(),
        "journal entry recorded"
    );
    Ok(entry)
}

/// Finish a successfully dispatched entry.
///
/// With zero retention the row is deleted outright; otherwise it flips to
/// `completed` and ages out through maintenance. Either way its dependency
/// edges are dropped so dependents become runnable.
pub async fn entry_complete(
    conn: &mut SqliteConnection,
    entry: &JournalEntry,
    completed_rows_retention: i64,
) -> Result<(), DbError> {
    if completed_rows_retention == 0 {
        store::delete_row(conn, entry).await?;
    } else {
        store::update_row_state(conn, entry, EntryState::Completed).await?;
    }
    store::delete_dependencies_on(conn, entry.seqnum).await
}

/// Return a claimed entry to `pending` without charging a retry. Used for
/// connection failures and dependency demotions, where the entry itself did
/// nothing wrong.
pub async fn entry_reset(conn: &mut SqliteConnection, entry: &JournalEntry) -> Result<(), DbError> {
    store::update_row_state(conn, entry, EntryState::Pending).await
}

/// Charge a retry against a claimed entry after an HTTP-level rejection.
/// Returns the state the entry ended in.
pub async fn entry_retry(
    conn: &mut SqliteConnection,
    entry: &JournalEntry,
    max_retries: i64,
) -> Result<EntryState, DbError> {
    let state = store::update_row_retry(conn, entry, max_retries).await?;
    if state == EntryState::Failed {
        tracing::warn!(
            seqnum = entry.seqnum,
            object_type = entry.object_type.as_str(),
            object_uuid = %entry.object_uuid,
            retry_count = entry.retry_count,
            "journal entry exhausted its retries"
        );
    }
    Ok(state)
}
