//! Engine configuration resolution
//!
//! Batch mode priority: command line → TOML `[reconcile] batch_mode` →
//! `reconcile_batch_mode` setting → default (single transaction).

use sqlx::SqlitePool;
use stokid_common::config::{BatchMode, TomlConfig};
use stokid_common::db::{get_setting, SETTING_RECONCILE_BATCH_MODE};
use stokid_common::Result;
use tracing::{info, warn};

/// Resolve the reconciler's batch mode
pub async fn resolve_batch_mode(
    db: &SqlitePool,
    toml_config: &TomlConfig,
    cli_per_entry: bool,
) -> Result<BatchMode> {
    let db_mode = match get_setting(db, SETTING_RECONCILE_BATCH_MODE).await? {
        Some(raw) => match raw.parse::<BatchMode>() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!("Ignoring stored batch mode: {}", e);
                None
            }
        },
        None => None,
    };
    let toml_mode = toml_config.reconcile.batch_mode;

    if let (Some(from_toml), Some(from_db)) = (toml_mode, db_mode) {
        if from_toml != from_db {
            warn!(
                "Batch mode differs between TOML ({}) and database ({}). Using TOML.",
                from_toml.as_str(),
                from_db.as_str()
            );
        }
    }

    if cli_per_entry {
        info!("Batch mode per_entry from command line");
        return Ok(BatchMode::PerEntry);
    }
    if let Some(mode) = toml_mode {
        info!("Batch mode {} from TOML config", mode.as_str());
        return Ok(mode);
    }
    if let Some(mode) = db_mode {
        return Ok(mode);
    }
    Ok(BatchMode::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stokid_common::config::ReconcileConfig;
    use stokid_common::db::{open_in_memory, set_setting};

    fn toml_with(mode: Option<BatchMode>) -> TomlConfig {
        TomlConfig {
            reconcile: ReconcileConfig { batch_mode: mode },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_comes_from_seeded_setting() {
        let pool = open_in_memory().await.unwrap();
        let mode = resolve_batch_mode(&pool, &toml_with(None), false).await.unwrap();
        assert_eq!(mode, BatchMode::SingleTransaction);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let pool = open_in_memory().await.unwrap();
        set_setting(&pool, SETTING_RECONCILE_BATCH_MODE, "per_entry").await.unwrap();

        assert_eq!(
            resolve_batch_mode(&pool, &toml_with(None), false).await.unwrap(),
            BatchMode::PerEntry
        );
        assert_eq!(
            resolve_batch_mode(&pool, &toml_with(Some(BatchMode::SingleTransaction)), false)
                .await
                .unwrap(),
            BatchMode::SingleTransaction
        );
        assert_eq!(
            resolve_batch_mode(&pool, &toml_with(Some(BatchMode::SingleTransaction)), true)
                .await
                .unwrap(),
            BatchMode::PerEntry
        );
    }

    #[tokio::test]
    async fn test_garbage_setting_falls_back() {
        let pool = open_in_memory().await.unwrap();
        set_setting(&pool, SETTING_RECONCILE_BATCH_MODE, "whenever").await.unwrap();
        let mode = resolve_batch_mode(&pool, &toml_with(None), false).await.unwrap();
        assert_eq!(mode, BatchMode::SingleTransaction);
    }
}
