//! Automatic Schema Synchronization
//!
//! Declarative table definitions are compared against `PRAGMA table_info`
//! and missing columns are added with `ALTER TABLE ... ADD COLUMN`. This lets
//! an older store (created before a column existed) open without manual
//! steps.
//!
//! Three-phase initialization:
//! 1. **CREATE TABLE IF NOT EXISTS** - Create missing tables
//! 2. **Auto-Sync** - Add missing columns (THIS MODULE)
//! 3. **Migrations** - Data fixes and indexes (migrations.rs)
//!
//! Type and constraint drift is only reported; fixing it needs a migration.

use crate::Result;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

/// Column definition with SQL constraints
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    /// SQL type (e.g., "TEXT", "INTEGER", "REAL", "TIMESTAMP")
    pub sql_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            primary_key: false,
            unique: false,
            default_value: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Clause usable in `ALTER TABLE ... ADD COLUMN`.
    ///
    /// Returns None when SQLite cannot add the column in place: PRIMARY KEY
    /// and UNIQUE columns, and NOT NULL columns without a constant default.
    fn add_column_sql(&self) -> Option<String> {
        if self.primary_key || self.unique {
            return None;
        }
        let mut sql = format!("{} {}", self.name, self.sql_type);
        match (&self.default_value, self.not_null) {
            (Some(default), true) if is_constant_default(default) => {
                sql.push_str(&format!(" NOT NULL DEFAULT {}", default));
            }
            (_, true) => return None,
            (Some(default), false) if is_constant_default(default) => {
                sql.push_str(&format!(" DEFAULT {}", default));
            }
            _ => {}
        }
        Some(sql)
    }
}

/// ALTER TABLE rejects non-constant defaults such as CURRENT_TIMESTAMP
fn is_constant_default(value: &str) -> bool {
    !value.trim().eq_ignore_ascii_case("CURRENT_TIMESTAMP")
}

/// Column as reported by `PRAGMA table_info`
#[derive(Debug, Clone)]
pub struct ActualColumn {
    pub cid: i32,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub pk: bool,
}

/// Difference between declared and actual schema
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDrift {
    MissingColumn {
        table: String,
        column: ColumnDefinition,
    },
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
}

/// Declared schema for one table
pub trait TableSchema {
    fn table_name() -> &'static str;

    /// Expected columns, in creation order
    fn expected_columns() -> Vec<ColumnDefinition>;
}

/// Read the actual columns of `table_name`, ordered by cid
pub async fn introspect_table(pool: &SqlitePool, table_name: &str) -> Result<Vec<ActualColumn>> {
    let query = format!("PRAGMA table_info({})", table_name);
    let rows = sqlx::query(&query).fetch_all(pool).await?;

    let mut columns: Vec<ActualColumn> = rows
        .iter()
        .map(|row| ActualColumn {
            cid: row.get("cid"),
            name: row.get("name"),
            type_name: row.get("type"),
            not_null: row.get::<i32, _>("notnull") != 0,
            pk: row.get::<i32, _>("pk") != 0,
        })
        .collect();
    columns.sort_by_key(|c| c.cid);

    Ok(columns)
}

/// Compare declared and actual columns
pub fn detect_drift(
    table: &str,
    expected: &[ColumnDefinition],
    actual: &[ActualColumn],
) -> Vec<SchemaDrift> {
    let mut drift = Vec::new();

    for column in expected {
        match actual.iter().find(|a| a.name.eq_ignore_ascii_case(&column.name)) {
            None => drift.push(SchemaDrift::MissingColumn {
                table: table.to_string(),
                column: column.clone(),
            }),
            Some(found) if !found.type_name.eq_ignore_ascii_case(&column.sql_type) => {
                drift.push(SchemaDrift::TypeMismatch {
                    table: table.to_string(),
                    column: column.name.clone(),
                    expected: column.sql_type.clone(),
                    actual: found.type_name.clone(),
                })
            }
            Some(_) => {}
        }
    }

    drift
}

/// Add every missing column of `T` to an existing table.
///
/// Returns the number of columns added. A table that does not exist yet is
/// left alone (phase 1 creates it).
pub async fn sync_table<T: TableSchema>(pool: &SqlitePool) -> Result<usize> {
    let table = T::table_name();
    let actual = introspect_table(pool, table).await?;
    if actual.is_empty() {
        return Ok(0);
    }

    let mut added = 0;
    for drift in detect_drift(table, &T::expected_columns(), &actual) {
        match drift {
            SchemaDrift::MissingColumn { table, column } => match column.add_column_sql() {
                Some(clause) => {
                    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {}", table, clause))
                        .execute(pool)
                        .await?;
                    info!("Schema sync: added column {}.{}", table, column.name);
                    added += 1;
                }
                None => warn!(
                    "Schema sync: column {}.{} cannot be added in place, needs a migration",
                    table, column.name
                ),
            },
            SchemaDrift::TypeMismatch {
                table,
                column,
                expected,
                actual,
            } => warn!(
                "Schema sync: {}.{} has type {} (expected {})",
                table, column, actual, expected
            ),
        }
    }

    Ok(added)
}
