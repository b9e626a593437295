//! Journal maintenance phases: retention purge and stuck-lease recovery.

use crate::error::{DbError, Result};
use crate::journal::store::{self, EntryState};
use crate::periodic::MaintenancePhase;

use async_trait::async_trait;
use sqlx::SqlitePool;

/// Purge completed rows older than the configured retention. Retention of
/// `-1` keeps rows forever; `0` means rows were already deleted on
/// completion, so there is nothing to age out either way.
pub struct DeleteCompletedRows {
    pool: SqlitePool,
    retention_seconds: i64,
}

impl DeleteCompletedRows {
    pub fn new(pool: SqlitePool, retention_seconds: i64) -> Self {
        Self {
            pool,
            retention_seconds,
        }
    }
}

#[async_trait]
impl MaintenancePhase for DeleteCompletedRows {
    fn name(&self) -> &'static str {
        "delete_completed_rows"
    }

    async fn run(&self) -> Result<()> {
        if self.retention_seconds <= 0 {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let deleted =
            store::delete_rows_by_state_and_age(&mut conn, EntryState::Completed, self.retention_seconds)
                .await?;
        if deleted > 0 {
            tracing::debug!(deleted, "purged aged-out completed journal rows");
        }
        Ok(())
    }
}

/// Return `processing` rows whose lease outlived `processing_timeout` to
/// `pending`. The holder is presumed dead; no retry is charged.
pub struct CleanupProcessingRows {
    pool: SqlitePool,
    processing_timeout_seconds: i64,
}

impl CleanupProcessingRows {
    pub fn new(pool: SqlitePool, processing_timeout_seconds: i64) -> Self {
        Self {
            pool,
            processing_timeout_seconds,
        }
    }
}

#[async_trait]
impl MaintenancePhase for CleanupProcessingRows {
    fn name(&self) -> &'static str {
        "cleanup_processing_rows"
    }

    async fn run(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let reset = store::reset_processing_rows(&mut conn, self.processing_timeout_seconds).await?;
        if reset > 0 {
            tracing::info!(reset, "reclaimed stuck processing journal rows");
        }
        Ok(())
    }
}
