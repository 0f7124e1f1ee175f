//! Configuration loading and database path resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Environment variable overriding the database location
pub const DATABASE_ENV_VAR: &str = "STOKID_DATABASE";

/// Environment variable pointing at an explicit TOML config file
pub const CONFIG_ENV_VAR: &str = "STOKID_CONFIG";

/// How the batch reconciler scopes its transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Whole batch in one transaction, one savepoint per entry
    #[default]
    SingleTransaction,
    /// Every entry commits on its own
    PerEntry,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::SingleTransaction => "single_transaction",
            BatchMode::PerEntry => "per_entry",
        }
    }
}

impl FromStr for BatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "single_transaction" => Ok(BatchMode::SingleTransaction),
            "per_entry" => Ok(BatchMode::PerEntry),
            other => Err(Error::Config(format!("Unknown batch mode: {}", other))),
        }
    }
}

/// `[logging]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[reconcile]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub batch_mode: Option<BatchMode>,
}

/// Contents of `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub database_path: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub reconcile: ReconcileConfig,
}

impl TomlConfig {
    /// Parse TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load config with priority: explicit path > STOKID_CONFIG > platform file.
    ///
    /// A missing or malformed file never aborts startup; defaults are used.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = match explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
            .or_else(platform_config_file)
        {
            Some(path) => path,
            None => return Self::default(),
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => {
                    info!("Loaded config file: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Ignoring config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Config file {} unreadable ({}), using defaults", path.display(), e);
                Self::default()
            }
        }
    }
}

/// Database path resolution:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_database_path(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.database_path {
        return path.clone();
    }

    default_database_path()
}

/// First existing platform config file, if any
fn platform_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("stokid").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/stokid/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stokid"))
        .unwrap_or_else(|| PathBuf::from("./stokid_data"))
        .join("stokid.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = TomlConfig::parse(
            r#"
            database_path = "/srv/shop/stock.db"

            [logging]
            level = "debug"

            [reconcile]
            batch_mode = "per_entry"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, Some(PathBuf::from("/srv/shop/stock.db")));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.reconcile.batch_mode, Some(BatchMode::PerEntry));
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = TomlConfig::parse("").unwrap();
        assert!(config.database_path.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.reconcile.batch_mode.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_batch_mode() {
        assert!(TomlConfig::parse("[reconcile]\nbatch_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_batch_mode_round_trip_through_str() {
        for mode in [BatchMode::SingleTransaction, BatchMode::PerEntry] {
            assert_eq!(mode.as_str().parse::<BatchMode>().unwrap(), mode);
        }
        assert!("bogus".parse::<BatchMode>().is_err());
    }

    #[test]
    fn test_default_database_path_ends_with_file_name() {
        assert!(default_database_path().ends_with("stokid.db"));
    }
}
