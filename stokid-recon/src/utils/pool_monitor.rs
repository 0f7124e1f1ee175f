//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a caller waited for a
//! connection and how long it held it.

use sqlx::{Sqlite, Transaction};
use std::time::Instant;
use stokid_common::Result;

/// Logs the hold time once, on commit, rollback or drop
struct HoldTimer {
    caller: &'static str,
    acquired_at: Instant,
    released: bool,
}

impl HoldTimer {
    fn release(&mut self, how: &'static str) {
        self.released = true;
        let held_ms = self.acquired_at.elapsed().as_millis();

        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                how,
                "LONG TRANSACTION - Connection held for extended period"
            );
        } else if held_ms > 1000 {
            tracing::info!(
                caller = self.caller,
                held_ms,
                how,
                "Transaction held longer than expected (>1s)"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, how, "Connection released");
        }
    }
}

impl Drop for HoldTimer {
    fn drop(&mut self) {
        if !self.released {
            // Dropped without commit: sqlx rolls back, usually an error path
            self.release("drop");
        }
    }
}

/// Monitored transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction {
    tx: Transaction<'static, Sqlite>,
    timer: HoldTimer,
}

impl MonitoredTransaction {
    /// Commit the transaction and log release timing
    pub async fn commit(self) -> Result<()> {
        let Self { tx, mut timer } = self;
        tx.commit().await?;
        timer.release("commit");
        Ok(())
    }

    /// Rollback the transaction and log release timing
    pub async fn rollback(self) -> Result<()> {
        let Self { tx, mut timer } = self;
        tx.rollback().await?;
        timer.release("rollback");
        Ok(())
    }

    /// Get a mutable reference to the inner transaction
    pub fn inner_mut(&mut self) -> &mut Transaction<'static, Sqlite> {
        &mut self.tx
    }

    pub fn caller(&self) -> &'static str {
        self.timer.caller
    }
}

/// Begin a monitored transaction with connection pool timing logs
///
/// ```ignore
/// let mut tx = begin_monitored(&pool, "deduplicator::merge_group").await?;
/// IdentityStore::delete_variant(&mut **tx.inner_mut(), &id).await?;
/// tx.commit().await?;
/// ```
pub async fn begin_monitored(
    pool: &sqlx::SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction> {
    let start = Instant::now();
    tracing::debug!(caller, "Connection acquisition requested");

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - Pool may be saturated (all connections in use)"
        );
    } else if wait_ms > 500 {
        tracing::info!(caller, wait_ms, "Connection acquisition slower than expected (>500ms)");
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx,
        timer: HoldTimer {
            caller,
            acquired_at: Instant::now(),
            released: false,
        },
    })
}
