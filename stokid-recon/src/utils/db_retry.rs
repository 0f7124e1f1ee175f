//! Database Retry Logic
//!
//! Exponential backoff for transient "database is locked" errors. The
//! total budget comes from the `db_max_lock_wait_ms` setting.

use std::time::{Duration, Instant};

use crate::error::ReconError;

/// Errors that can report SQLite lock contention
pub trait LockContention {
    fn is_lock_contention(&self) -> bool;
}

impl LockContention for stokid_common::Error {
    fn is_lock_contention(&self) -> bool {
        stokid_common::Error::is_lock_contention(self)
    }
}

impl LockContention for ReconError {
    fn is_lock_contention(&self) -> bool {
        match self {
            ReconError::Store(err) => err.is_lock_contention(),
            _ => false,
        }
    }
}

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;
/// Successful retries slower than this are logged at WARN
const SLOW_RECOVERY_MS: u128 = 2000;

/// Run `operation` until it succeeds, fails with something other than
/// lock contention, or `max_wait_ms` has passed since the first attempt.
///
/// Backoff starts at 10ms and doubles up to 1s between attempts. Once the
/// budget is spent the last lock error is returned as is.
///
/// Each attempt must be a complete unit of work (its own transaction), so
/// a retry never replays half of a previous attempt.
pub async fn retry_on_lock<F, Fut, T, E>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: LockContention + std::fmt::Display,
{
    let started = Instant::now();
    let budget = Duration::from_millis(max_wait_ms);
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                let waited_ms = started.elapsed().as_millis();
                if attempt > 1 && waited_ms > SLOW_RECOVERY_MS {
                    tracing::warn!(operation = operation_name, attempt, waited_ms, "Lock cleared after a long wait");
                } else if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, waited_ms, "Lock cleared");
                }
                return Ok(value);
            }
            Err(err) if !err.is_lock_contention() => return Err(err),
            Err(err) => err,
        };

        let waited = started.elapsed();
        if waited >= budget {
            tracing::error!(
                operation = operation_name,
                attempt,
                waited_ms = waited.as_millis(),
                max_wait_ms,
                error = %err,
                "Giving up on locked database"
            );
            return Err(err);
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            waited_ms = waited.as_millis(),
            backoff_ms = backoff.as_millis(),
            "Database locked, backing off"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
    }
}
