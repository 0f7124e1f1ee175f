//! Database schema migrations
//!
//! Versioned data fixes applied after column sync. Each migration is
//! idempotent and recorded in `schema_version`.
//!
//! 1. **Never modify existing migrations** - stores upgrading from older versions depend on them
//! 2. **Always add new migrations** - one function per change, bump `CURRENT_SCHEMA_VERSION`
//! 3. **Test against the legacy layout** - the tests below build pre-migration tables by hand

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    if !table_exists(pool, "schema_version").await? {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    if current_version < 3 {
        migrate_v3(pool).await?;
        set_schema_version(pool, 3).await?;
        info!("Migration v3 completed");
    }

    if current_version < 4 {
        migrate_v4(pool).await?;
        set_schema_version(pool, 4).await?;
        info!("Migration v4 completed");
    }

    Ok(())
}

/// Migration v1: fold NULL text attributes to ''
///
/// Older stores wrote NULL for "no brand" and similar. Matching treats
/// NULL and '' the same, but keeping one representation on disk lets the
/// duplicate-group query use plain equality.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    const TARGETS: &[(&str, &[&str])] = &[
        (
            "stock_variant",
            &["name", "brand", "variant_tag", "category", "description"],
        ),
        (
            "sale_record",
            &["product_name", "brand", "identity_id", "customer_id", "customer_name"],
        ),
    ];

    for (table, columns) in TARGETS {
        if !table_exists(pool, table).await? {
            continue;
        }
        for column in *columns {
            let result = sqlx::query(&format!(
                "UPDATE {table} SET {column} = '' WHERE {column} IS NULL"
            ))
            .execute(pool)
            .await?;
            if result.rows_affected() > 0 {
                info!(
                    "  {}.{}: {} NULL value(s) set to ''",
                    table,
                    column,
                    result.rows_affected()
                );
            }
        }
    }

    Ok(())
}

/// Migration v2: every stock variant gets a distinct identity_id
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    if !table_exists(pool, "stock_variant").await? {
        return Ok(());
    }
    let assigned = assign_missing_identities(pool).await?;
    if assigned > 0 {
        info!("  Assigned {} identity id(s)", assigned);
    }
    Ok(())
}

/// Migration v3: lookup indexes, including uniqueness of identity_id
async fn migrate_v3(pool: &SqlitePool) -> Result<()> {
    let statements = [
        (
            "stock_variant",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_stock_variant_identity ON stock_variant(identity_id)",
        ),
        (
            "stock_variant",
            "CREATE INDEX IF NOT EXISTS idx_stock_variant_group ON stock_variant(barcode, name, brand)",
        ),
        (
            "sale_record",
            "CREATE INDEX IF NOT EXISTS idx_sale_record_identity ON sale_record(identity_id)",
        ),
    ];
    for (table, sql) in statements {
        if table_exists(pool, table).await? {
            sqlx::query(sql).execute(pool).await?;
        }
    }
    Ok(())
}

/// Migration v4: strip padding from stored barcodes
///
/// Barcode lookups compare with plain equality so they can use the
/// barcode indexes; legacy rows written before barcodes were trimmed on
/// insert would otherwise never be found.
async fn migrate_v4(pool: &SqlitePool) -> Result<()> {
    for table in ["stock_variant", "sale_record"] {
        if !table_exists(pool, table).await? {
            continue;
        }
        let result = sqlx::query(&format!(
            "UPDATE {table} SET barcode = TRIM(barcode) WHERE barcode != TRIM(barcode)"
        ))
        .execute(pool)
        .await?;
        if result.rows_affected() > 0 {
            info!("  {}: trimmed {} barcode(s)", table, result.rows_affected());
        }
    }
    Ok(())
}

/// Give every stock variant without an identity (NULL, blank, or shared
/// with an earlier row) a fresh one.
///
/// For a shared identity the lowest `seq` keeps it. Returns the number of
/// rows that received a new identity.
pub async fn assign_missing_identities(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let rows: Vec<(i64, Option<String>)> =
        sqlx::query_as("SELECT seq, identity_id FROM stock_variant ORDER BY seq")
            .fetch_all(&mut *tx)
            .await?;

    let mut seen = std::collections::HashSet::new();
    let mut assigned = 0u64;

    for (seq, identity) in rows {
        let keep = match identity.as_deref().map(str::trim) {
            Some(id) if crate::identity::is_present(id) => {
                if seen.insert(id.to_string()) {
                    true
                } else {
                    warn!(seq, identity_id = %id, "Duplicate identity id, reassigning");
                    false
                }
            }
            _ => false,
        };
        if keep {
            continue;
        }

        let fresh = crate::identity::generate();
        sqlx::query("UPDATE stock_variant SET identity_id = ? WHERE seq = ?")
            .bind(&fresh)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        seen.insert(fresh);
        assigned += 1;
    }

    tx.commit().await?;
    Ok(assigned)
}
