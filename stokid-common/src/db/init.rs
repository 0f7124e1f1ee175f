//! Database initialization
//!
//! Opening a store always runs the same idempotent sequence:
//! 1. CREATE TABLE IF NOT EXISTS for every table
//! 2. Automatic column sync (table_schemas.rs)
//! 3. Versioned migrations (migrations.rs)
//! 4. Default settings

use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// SQLite busy_timeout; longer waits are handled by retry with backoff
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;

/// Setting key: total time a single unit of work may spend retrying a lock
pub const SETTING_MAX_LOCK_WAIT_MS: &str = "db_max_lock_wait_ms";

/// Setting key: default batch mode for the reconciler
pub const SETTING_RECONCILE_BATCH_MODE: &str = "reconcile_batch_mode";

/// Open (creating if needed) the store at `db_path` and bring its schema up to date
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let path_str = db_path
        .to_str()
        .ok_or_else(|| Error::Config(format!("Invalid database path: {}", db_path.display())))?;

    let options = SqliteConnectOptions::from_str(path_str)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));

    // Single writer at a time; a small pool is plenty for maintenance passes
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    prepare_schema(&pool).await?;
    Ok(pool)
}

/// Open a private in-memory store with the full schema.
///
/// The pool pins exactly one connection so every query sees the same
/// database. Callers must not read through the pool while holding a
/// transaction from it.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    prepare_schema(&pool).await?;
    Ok(pool)
}

/// Phases 1-4 of initialization. Safe to call repeatedly.
pub async fn prepare_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_stock_variant_table(pool).await?;
    create_sale_record_table(pool).await?;

    crate::db::table_schemas::sync_all_table_schemas(pool).await?;
    crate::db::migrations::run_migrations(pool).await?;

    init_default_settings(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime tunables as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the stock_variant table
///
/// `seq` is the creation ordinal used to pick the canonical row of a
/// duplicate group. `identity_id` is the stable surrogate key.
pub async fn create_stock_variant_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stock_variant (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id TEXT UNIQUE,
            barcode TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            brand TEXT NOT NULL DEFAULT '',
            variant_tag TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            quantity_on_hand INTEGER NOT NULL DEFAULT 0,
            cost_price REAL NOT NULL DEFAULT 0,
            sale_price REAL NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (quantity_on_hand >= 0),
            CHECK (cost_price >= 0),
            CHECK (sale_price >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stock_variant_barcode ON stock_variant(barcode)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the sale_record table
///
/// Name, brand and prices are snapshots taken at sale time.
pub async fn create_sale_record_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sale_record (
            sale_id INTEGER PRIMARY KEY AUTOINCREMENT,
            barcode TEXT NOT NULL,
            product_name TEXT NOT NULL DEFAULT '',
            brand TEXT NOT NULL DEFAULT '',
            identity_id TEXT NOT NULL DEFAULT '',
            quantity INTEGER NOT NULL DEFAULT 0,
            unit_price REAL NOT NULL DEFAULT 0,
            cost_price_snapshot REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            is_debt INTEGER NOT NULL DEFAULT 0,
            timestamp TIMESTAMP NOT NULL,
            customer_id TEXT NOT NULL DEFAULT '',
            customer_name TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sale_record_barcode ON sale_record(barcode)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize or repair default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(pool, SETTING_MAX_LOCK_WAIT_MS, "5000").await?;
    ensure_setting(pool, SETTING_RECONCILE_BATCH_MODE, "single_transaction").await?;
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// A missing setting is created; a NULL value is reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let existing: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match existing {
        None => {
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(default_value)
                .execute(pool)
                .await?;
            info!("Initialized setting '{}' with default value: {}", key, default_value);
        }
        Some(None) => {
            sqlx::query("UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ?")
                .bind(default_value)
                .bind(key)
                .execute(pool)
                .await?;
            warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
        }
        Some(Some(_)) => {}
    }

    Ok(())
}

/// Read a raw setting value
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

/// Read and parse a setting, falling back to `default` when absent or unparseable
pub async fn get_setting_or<T: FromStr>(pool: &SqlitePool, key: &str, default: T) -> Result<T> {
    match get_setting(pool, key).await? {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!("Setting '{}' has unparseable value '{}', using default", key, raw);
                Ok(default)
            }
        },
        None => Ok(default),
    }
}

/// Write a setting value
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchMode;

    #[tokio::test]
    async fn test_open_in_memory_creates_tables() {
        let pool = open_in_memory().await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert!(tables.contains(&"stock_variant".to_string()));
        assert!(tables.contains(&"sale_record".to_string()));
        assert!(tables.contains(&"settings".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[tokio::test]
    async fn test_prepare_schema_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        prepare_schema(&pool).await.unwrap();
        prepare_schema(&pool).await.unwrap();

        let settings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(settings, 2);
    }

    #[tokio::test]
    async fn test_null_setting_is_reset() {
        let pool = open_in_memory().await.unwrap();
        sqlx::query("UPDATE settings SET value = NULL WHERE key = ?")
            .bind(SETTING_MAX_LOCK_WAIT_MS)
            .execute(&pool)
            .await
            .unwrap();

        init_default_settings(&pool).await.unwrap();

        let value = get_setting_or(&pool, SETTING_MAX_LOCK_WAIT_MS, 0u64).await.unwrap();
        assert_eq!(value, 5000);
    }

    #[tokio::test]
    async fn test_setting_round_trip() {
        let pool = open_in_memory().await.unwrap();

        set_setting(&pool, SETTING_RECONCILE_BATCH_MODE, "per_entry").await.unwrap();
        let mode = get_setting_or(&pool, SETTING_RECONCILE_BATCH_MODE, BatchMode::SingleTransaction)
            .await
            .unwrap();
        assert_eq!(mode, BatchMode::PerEntry);

        set_setting(&pool, SETTING_MAX_LOCK_WAIT_MS, "soon").await.unwrap();
        let wait = get_setting_or(&pool, SETTING_MAX_LOCK_WAIT_MS, 42u64).await.unwrap();
        assert_eq!(wait, 42);
    }
}
