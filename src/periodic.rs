//! DB-leased periodic tasks.
//!
//! Several processes may share one journal database; the `periodic_tasks`
//! table makes sure each named task runs in exactly one of them per
//! interval. The lease acquire is a single guarded UPDATE: it succeeds only
//! when the previous run finished (or its holder died) at least one interval
//! ago, which covers both the back-to-back guard and the stale-lease steal.

use crate::error::{DbError, Result};

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One phase of a periodic task. Phases run in registration order; a
/// failing phase is logged and the remaining phases still run.
#[async_trait]
pub trait MaintenancePhase: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<()>;
}

/// A named, DB-leased periodic task.
pub struct PeriodicTask {
    pool: SqlitePool,
    name: &'static str,
    interval: Duration,
    phases: Vec<Arc<dyn MaintenancePhase>>,
}

impl PeriodicTask {
    pub fn new(pool: SqlitePool, name: &'static str, interval: Duration) -> Self {
        Self {
            pool,
            name,
            interval,
            phases: Vec::new(),
        }
    }

    pub fn register(&mut self, phase: Arc<dyn MaintenancePhase>) {
        self.phases.push(phase);
    }

    /// Tick at the configured interval until the stop channel flips.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        self.seed().await?;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                tracing::info!(task = self.name, "periodic task stopping");
                return Ok(());
            }
            if let Err(err) = self.execute_if_leased().await {
                tracing::error!(task = self.name, error = %err, "periodic task pass failed");
            }
        }
    }

    /// Ensure the lease row exists, backdated so the first tick can acquire
    /// it.
    async fn seed(&self) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO periodic_tasks (task, lock_updated)
             VALUES (?, datetime('now', '-' || ? || ' seconds'))",
        )
        .bind(self.name)
        // One extra second so the first tick clears the strict age check.
        .bind(self.interval.as_secs() as i64 + 1)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    /// Try to take the lease; on success run every phase, then release.
    pub async fn execute_if_leased(&self) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        if !acquire(&mut conn, self.name, self.interval).await? {
            tracing::debug!(task = self.name, "lease held elsewhere or ran recently, skipping");
            return Ok(false);
        }

        tracing::debug!(task = self.name, "lease acquired");
        for phase in &self.phases {
            set_operation(&mut conn, self.name, phase.name()).await?;
            if let Err(err) = phase.run().await {
                tracing::error!(
                    task = self.name,
                    phase = phase.name(),
                    error = %err,
                    "maintenance phase failed"
                );
            }
        }

        release(&mut conn, self.name).await?;
        Ok(true)
    }
}

/// Guarded lease acquire. `lock_updated` older than one interval means the
/// previous run either finished long enough ago or its holder is gone. A
/// live holder keeps the lock fresh through `set_operation`, so the age
/// check alone enforces the lease; `state` and `processing_operation` are
/// written for operators inspecting the table, never read back.
async fn acquire(conn: &mut SqliteConnection, task: &str, interval: Duration) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE periodic_tasks
         SET state = 'processing', processing_operation = NULL,
             lock_updated = CURRENT_TIMESTAMP
         WHERE task = ?
           AND lock_updated < datetime('now', '-' || ? || ' seconds')",
    )
    .bind(task)
    .bind(interval.as_secs() as i64)
    .execute(conn)
    .await
    .map_err(DbError::from)?;
    Ok(result.rows_affected() == 1)
}

/// Record the phase in flight, for operators inspecting a wedged task. Also
/// refreshes the lease.
async fn set_operation(conn: &mut SqliteConnection, task: &str, operation: &str) -> Result<()> {
    sqlx::query(
        "UPDATE periodic_tasks
         SET processing_operation = ?, lock_updated = CURRENT_TIMESTAMP
         WHERE task = ?",
    )
    .bind(operation)
    .bind(task)
    .execute(conn)
    .await
    .map_err(DbError::from)?;
    Ok(())
}

async fn release(conn: &mut SqliteConnection, task: &str) -> Result<()> {
    sqlx::query(
        "UPDATE periodic_tasks
         SET state = 'pending', processing_operation = NULL,
             lock_updated = CURRENT_TIMESTAMP
         WHERE task = ?",
    )
    .bind(task)
    .execute(conn)
    .await
    .map_err(DbError::from)?;
    Ok(())
}
