//! Row-level operations on the journal table.
//!
//! Every mutation bumps `version_id` and is guarded by the caller's
//! snapshot of it, so two processes racing on the same row leave exactly one
//! winner; the loser gets [`DbError::StaleRow`] and retries its transaction.

use crate::error::DbError;
use crate::resources::{Operation, ResourceType};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqliteConnection};

/// Journal entry states. `Completed` and `Failed` are terminal; `Failed`
/// may be revived by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Processing => "processing",
            EntryState::Completed => "completed",
            EntryState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryState::Pending),
            "processing" => Some(EntryState::Processing),
            "completed" => Some(EntryState::Completed),
            "failed" => Some(EntryState::Failed),
            _ => None,
        }
    }
}

/// One journal row.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seqnum: i64,
    pub object_type: ResourceType,
    pub object_uuid: String,
    pub operation: Operation,
    pub data: Value,
    pub state: EntryState,
    pub retry_count: i64,
    pub version_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_retried: DateTime<Utc>,
}

const ENTRY_COLUMNS: &str = "seqnum, object_type, object_uuid, operation, data, state, \
     retry_count, version_id, created_at, last_retried";

fn entry_from_row(row: &SqliteRow) -> Result<JournalEntry, DbError> {
    let object_type: String = row.try_get("object_type")?;
    let operation: String = row.try_get("operation")?;
    let state: String = row.try_get("state")?;
    let data: String = row.try_get("data")?;

    let decode = |what: &str| DbError::Sqlx(sqlx::Error::Decode(what.to_string().into()));

    Ok(JournalEntry {
        seqnum: row.try_get("seqnum")?,
        object_type: ResourceType::parse(&object_type)
            .ok_or_else(|| decode("unknown object_type"))?,
        object_uuid: row.try_get("object_uuid")?,
        operation: Operation::parse(&operation).ok_or_else(|| decode("unknown operation"))?,
        data: serde_json::from_str(&data).map_err(|_| decode("malformed data payload"))?,
        state: EntryState::parse(&state).ok_or_else(|| decode("unknown state"))?,
        retry_count: row.try_get("retry_count")?,
        version_id: row.try_get("version_id")?,
        created_at: row.try_get("created_at")?,
        last_retried: row.try_get("last_retried")?,
    })
}

/// Insert a new pending row with its dependency edges.
///
/// `depends_on` references entries recorded earlier; if one of them was
/// purged between dependency calculation and this insert, the foreign key
/// trips and the caller must retry its transaction.
pub async fn create_pending_row(
    conn: &mut SqliteConnection,
    object_type: ResourceType,
    object_uuid: &str,
    operation: Operation,
    data: &Value,
    depends_on: &[i64],
) -> Result<JournalEntry, DbError> {
    let payload = serde_json::to_string(data)
        .map_err(|e| DbError::Sqlx(sqlx::Error::Encode(Box::new(e))))?;

    let row = sqlx::query(&format!(
        "INSERT INTO journal (object_type, object_uuid, operation, data)
         VALUES (?, ?, ?, ?)
         RETURNING {ENTRY_COLUMNS}"
    ))
    .bind(object_type.as_str())
    .bind(object_uuid)
    .bind(operation.as_str())
    .bind(payload)
    .fetch_one(&mut *conn)
    .await?;

    let entry = entry_from_row(&row)?;

    for dep in depends_on {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO journal_dependencies (entry, depends_on) VALUES (?, ?)",
        )
        .bind(entry.seqnum)
        .bind(dep)
        .execute(&mut *conn)
        .await;

        if let Err(sqlx::Error::Database(db)) = &result {
            if db.message().contains("FOREIGN KEY") {
                return Err(DbError::ReferenceError);
            }
        }
        result?;
    }

    Ok(entry)
}

/// Atomically claim the oldest runnable entry.
///
/// Runnable means `pending` with no remaining dependency edge (edges are
/// removed when the depended-on entry completes). The claim itself is a
/// single UPDATE, so at most one caller across the fleet observes a given
/// entry as `processing`. Ties break by `last_retried`, then `seqnum`.
pub async fn claim_oldest_runnable(
    conn: &mut SqliteConnection,
) -> Result<Option<JournalEntry>, DbError> {
    let row = sqlx::query(&format!(
        "UPDATE journal
         SET state = 'processing',
             last_retried = CURRENT_TIMESTAMP,
             version_id = version_id + 1
         WHERE seqnum = (
             SELECT j.seqnum FROM journal j
             WHERE j.state = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM journal_dependencies d WHERE d.entry = j.seqnum
               )
             ORDER BY j.last_retried ASC, j.seqnum ASC
             LIMIT 1
         )
         RETURNING {ENTRY_COLUMNS}"
    ))
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Move an entry to the given state, guarded by the caller's `version_id`
/// snapshot.
pub async fn update_row_state(
    conn: &mut SqliteConnection,
    entry: &JournalEntry,
    state: EntryState,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE journal
         SET state = ?, last_retried = CURRENT_TIMESTAMP, version_id = version_id + 1
         WHERE seqnum = ? AND version_id = ?",
    )
    .bind(state.as_str())
    .bind(entry.seqnum)
    .bind(entry.version_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::StaleRow);
    }
    Ok(())
}

/// Apply the retry policy after a failed dispatch: below the ceiling the
/// entry returns to `pending` with the counter bumped, at the ceiling it
/// flips to `failed`. Returns the state the entry ended in.
pub async fn update_row_retry(
    conn: &mut SqliteConnection,
    entry: &JournalEntry,
    max_retries: i64,
) -> Result<EntryState, DbError> {
    let (state, retry_count) = if entry.retry_count >= max_retries {
        (EntryState::Failed, entry.retry_count)
    } else {
        (EntryState::Pending, entry.retry_count + 1)
    };

    let result = sqlx::query(
        "UPDATE journal
         SET state = ?, retry_count = ?, last_retried = CURRENT_TIMESTAMP,
             version_id = version_id + 1
         WHERE seqnum = ? AND version_id = ?",
    )
    .bind(state.as_str())
    .bind(retry_count)
    .bind(entry.seqnum)
    .bind(entry.version_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::StaleRow);
    }
    Ok(state)
}

/// Delete a single row. Dependency edges cascade.
pub async fn delete_row(conn: &mut SqliteConnection, entry: &JournalEntry) -> Result<(), DbError> {
    sqlx::query("DELETE FROM journal WHERE seqnum = ?")
        .bind(entry.seqnum)
        .execute(conn)
        .await?;
    Ok(())
}

/// Drop the dependency edges that pointed at a now-completed entry,
/// unblocking its dependents.
pub async fn delete_dependencies_on(
    conn: &mut SqliteConnection,
    seqnum: i64,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM journal_dependencies WHERE depends_on = ?")
        .bind(seqnum)
        .execute(conn)
        .await?;
    Ok(())
}

/// Pending or processing entries for one object uuid, oldest first,
/// optionally restricted to certain operations.
pub async fn pending_or_processing_ops(
    conn: &mut SqliteConnection,
    object_uuid: &str,
    operations: Option<&[Operation]>,
) -> Result<Vec<JournalEntry>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal
         WHERE object_uuid = ? AND state IN ('pending', 'processing')
         ORDER BY seqnum ASC"
    ))
    .bind(object_uuid)
    .fetch_all(&mut *conn)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        let entry = entry_from_row(row)?;
        if let Some(ops) = operations {
            if !ops.contains(&entry.operation) {
                continue;
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Pending delete entries of `object_type` whose recorded parent list
/// contains `parent_uuid`. Delete entries store a JSON array of parent
/// identifiers precisely to make this query possible.
pub async fn pending_delete_ops_with_parent(
    conn: &mut SqliteConnection,
    object_type: ResourceType,
    parent_uuid: &str,
) -> Result<Vec<JournalEntry>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal
         WHERE object_type = ? AND operation = 'delete'
           AND state IN ('pending', 'processing')
         ORDER BY seqnum ASC"
    ))
    .bind(object_type.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut entries = Vec::new();
    for row in &rows {
        let entry = entry_from_row(row)?;
        let references_parent = entry
            .data
            .as_array()
            .is_some_and(|parents| parents.iter().any(|p| p.as_str() == Some(parent_uuid)));
        if references_parent {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// All rows in the given state, oldest first.
pub async fn get_rows_by_state(
    conn: &mut SqliteConnection,
    state: EntryState,
) -> Result<Vec<JournalEntry>, DbError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal WHERE state = ? ORDER BY seqnum ASC"
    ))
    .bind(state.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Fetch one row by seqnum.
pub async fn get_row(
    conn: &mut SqliteConnection,
    seqnum: i64,
) -> Result<Option<JournalEntry>, DbError> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal WHERE seqnum = ?"
    ))
    .bind(seqnum)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Purge pending rows carrying any of the given operations. Used by
/// full-sync, which re-records everything against an empty controller.
pub async fn delete_pending_rows(
    conn: &mut SqliteConnection,
    operations: &[Operation],
) -> Result<u64, DbError> {
    let mut deleted = 0;
    for op in operations {
        let result = sqlx::query("DELETE FROM journal WHERE state = 'pending' AND operation = ?")
            .bind(op.as_str())
            .execute(&mut *conn)
            .await?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

/// Delete rows in `state` whose last transition is older than `max_age`
/// seconds. Retention maintenance.
pub async fn delete_rows_by_state_and_age(
    conn: &mut SqliteConnection,
    state: EntryState,
    max_age_seconds: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM journal
         WHERE state = ?
           AND last_retried < datetime('now', '-' || ? || ' seconds')",
    )
    .bind(state.as_str())
    .bind(max_age_seconds)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Return stuck `processing` rows (lease older than `timeout` seconds) to
/// `pending` without touching `retry_count`.
pub async fn reset_processing_rows(
    conn: &mut SqliteConnection,
    timeout_seconds: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE journal
         SET state = 'pending', last_retried = CURRENT_TIMESTAMP,
             version_id = version_id + 1
         WHERE state = 'processing'
           AND last_retried < datetime('now', '-' || ? || ' seconds')",
    )
    .bind(timeout_seconds)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    async fn record_simple(
        conn: &mut SqliteConnection,
        object_type: ResourceType,
        uuid: &str,
        operation: Operation,
    ) -> JournalEntry {
        create_pending_row(conn, object_type, uuid, operation, &json!({"id": uuid}), &[])
            .await
            .expect("row should insert")
    }

    #[tokio::test]
    async fn seqnum_is_monotone() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let first = record_simple(&mut conn, ResourceType::Network, "N1", Operation::Create).await;
        let second = record_simple(&mut conn, ResourceType::Network, "N2", Operation::Create).await;
        assert!(second.seqnum > first.seqnum);
    }

    #[tokio::test]
    async fn claim_picks_oldest_runnable() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let first = record_simple(&mut conn, ResourceType::Network, "N1", Operation::Create).await;
        record_simple(&mut conn, ResourceType::Network, "N2", Operation::Create).await;

        let claimed = claim_oldest_runnable(&mut conn)
            .await
            .expect("claim should work")
            .expect("an entry should be runnable");
        assert_eq!(claimed.seqnum, first.seqnum);
        assert_eq!(claimed.state, EntryState::Processing);
    }

    #[tokio::test]
    async fn claim_skips_entries_with_open_dependencies() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let parent =
            record_simple(&mut conn, ResourceType::Network, "N1", Operation::Create).await;
        let child = create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S1",
            Operation::Create,
            &json!({"id": "S1", "network_id": "N1"}),
            &[parent.seqnum],
        )
        .await
        .expect("child should insert");

        // The only runnable entry is the parent.
        let claimed = claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("parent should be claimable");
        assert_eq!(claimed.seqnum, parent.seqnum);

        // Child stays blocked while the parent is processing.
        assert!(claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .is_none());

        // Completing the parent unblocks the child.
        update_row_state(&mut conn, &claimed, EntryState::Completed)
            .await
            .expect("complete");
        delete_dependencies_on(&mut conn, parent.seqnum)
            .await
            .expect("deps should clear");

        let claimed = claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("child should now be claimable");
        assert_eq!(claimed.seqnum, child.seqnum);
    }

    #[tokio::test]
    async fn stale_version_loses_the_race() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let entry = record_simple(&mut conn, ResourceType::Port, "P1", Operation::Create).await;

        update_row_state(&mut conn, &entry, EntryState::Processing)
            .await
            .expect("first writer wins");
        let err = update_row_state(&mut conn, &entry, EntryState::Completed)
            .await
            .expect_err("second writer must lose");
        assert!(matches!(err, DbError::StaleRow));
    }

    #[tokio::test]
    async fn retry_policy_flips_to_failed_at_ceiling() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let mut entry =
            record_simple(&mut conn, ResourceType::Port, "P1", Operation::Create).await;

        // Ceiling of 2: two bumps back to pending, the third goes failed.
        for attempt in 0..2 {
            let state = update_row_retry(&mut conn, &entry, 2).await.expect("retry");
            assert_eq!(state, EntryState::Pending, "attempt {attempt}");
            entry = get_row(&mut conn, entry.seqnum)
                .await
                .expect("fetch")
                .expect("entry exists");
            assert_eq!(entry.retry_count, attempt + 1);
        }

        let state = update_row_retry(&mut conn, &entry, 2).await.expect("retry");
        assert_eq!(state, EntryState::Failed);
    }

    #[tokio::test]
    async fn stuck_processing_rows_reset_without_retry_bump() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let entry = record_simple(&mut conn, ResourceType::Network, "N1", Operation::Create).await;
        let claimed = claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("claimable");
        assert_eq!(claimed.seqnum, entry.seqnum);

        // Backdate the lease beyond the timeout.
        sqlx::query(
            "UPDATE journal SET last_retried = datetime('now', '-1 hour') WHERE seqnum = ?",
        )
        .bind(entry.seqnum)
        .execute(&mut *conn)
        .await
        .expect("backdate");

        let reset = reset_processing_rows(&mut conn, 600).await.expect("reset");
        assert_eq!(reset, 1);

        let row = get_row(&mut conn, entry.seqnum)
            .await
            .expect("fetch")
            .expect("entry exists");
        assert_eq!(row.state, EntryState::Pending);
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn fresh_processing_rows_are_left_alone() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        record_simple(&mut conn, ResourceType::Network, "N1", Operation::Create).await;
        claim_oldest_runnable(&mut conn)
            .await
            .expect("claim")
            .expect("claimable");

        let reset = reset_processing_rows(&mut conn, 600).await.expect("reset");
        assert_eq!(reset, 0);
    }

    #[tokio::test]
    async fn retention_deletes_only_old_completed_rows() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let old = record_simple(&mut conn, ResourceType::Network, "N1", Operation::Create).await;
        let fresh = record_simple(&mut conn, ResourceType::Network, "N2", Operation::Create).await;

        update_row_state(&mut conn, &old, EntryState::Completed)
            .await
            .expect("complete");
        update_row_state(&mut conn, &fresh, EntryState::Completed)
            .await
            .expect("complete");
        sqlx::query(
            "UPDATE journal SET last_retried = datetime('now', '-2 hours') WHERE seqnum = ?",
        )
        .bind(old.seqnum)
        .execute(&mut *conn)
        .await
        .expect("backdate");

        let deleted = delete_rows_by_state_and_age(&mut conn, EntryState::Completed, 3600)
            .await
            .expect("purge");
        assert_eq!(deleted, 1);
        assert!(get_row(&mut conn, old.seqnum).await.expect("fetch").is_none());
        assert!(get_row(&mut conn, fresh.seqnum)
            .await
            .expect("fetch")
            .is_some());
    }

    #[tokio::test]
    async fn delete_ops_with_parent_matches_recorded_parent_list() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S1",
            Operation::Delete,
            &json!(["N1"]),
            &[],
        )
        .await
        .expect("insert");
        create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S2",
            Operation::Delete,
            &json!(["N2"]),
            &[],
        )
        .await
        .expect("insert");

        let matches = pending_delete_ops_with_parent(&mut conn, ResourceType::Subnet, "N1")
            .await
            .expect("query");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].object_uuid, "S1");
    }
}
