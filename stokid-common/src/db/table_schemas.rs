//! Table Schema Definitions
//!
//! Single source of truth for the columns of `stock_variant` and
//! `sale_record`. The CREATE TABLE statements in init.rs must agree with
//! these lists.

use crate::db::schema_sync::{sync_table, ColumnDefinition, TableSchema};
use crate::Result;
use sqlx::SqlitePool;
use tracing::info;

/// `stock_variant`: one row per sellable variant
pub struct StockVariantTableSchema;

impl TableSchema for StockVariantTableSchema {
    fn table_name() -> &'static str {
        "stock_variant"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("seq", "INTEGER").primary_key(),
            // Nullable on legacy stores; migration v2 fills it, v3 indexes it UNIQUE
            ColumnDefinition::new("identity_id", "TEXT").unique(),
            ColumnDefinition::new("barcode", "TEXT").not_null(),
            ColumnDefinition::new("name", "TEXT").not_null().default("''"),
            ColumnDefinition::new("brand", "TEXT").not_null().default("''"),
            ColumnDefinition::new("variant_tag", "TEXT").not_null().default("''"),
            ColumnDefinition::new("category", "TEXT").not_null().default("''"),
            ColumnDefinition::new("description", "TEXT").not_null().default("''"),
            ColumnDefinition::new("quantity_on_hand", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("cost_price", "REAL").not_null().default("0"),
            ColumnDefinition::new("sale_price", "REAL").not_null().default("0"),
            ColumnDefinition::new("created_at", "TIMESTAMP")
                .not_null()
                .default("CURRENT_TIMESTAMP"),
            ColumnDefinition::new("updated_at", "TIMESTAMP")
                .not_null()
                .default("CURRENT_TIMESTAMP"),
        ]
    }
}

/// `sale_record`: one row per historical sale line
pub struct SaleRecordTableSchema;

impl TableSchema for SaleRecordTableSchema {
    fn table_name() -> &'static str {
        "sale_record"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("sale_id", "INTEGER").primary_key(),
            ColumnDefinition::new("barcode", "TEXT").not_null(),
            ColumnDefinition::new("product_name", "TEXT").not_null().default("''"),
            ColumnDefinition::new("brand", "TEXT").not_null().default("''"),
            ColumnDefinition::new("identity_id", "TEXT").not_null().default("''"),
            ColumnDefinition::new("quantity", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("unit_price", "REAL").not_null().default("0"),
            ColumnDefinition::new("cost_price_snapshot", "REAL").not_null().default("0"),
            ColumnDefinition::new("total", "REAL").not_null().default("0"),
            ColumnDefinition::new("is_debt", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("timestamp", "TIMESTAMP").not_null(),
            ColumnDefinition::new("customer_id", "TEXT").not_null().default("''"),
            ColumnDefinition::new("customer_name", "TEXT").not_null().default("''"),
            ColumnDefinition::new("created_at", "TIMESTAMP")
                .not_null()
                .default("CURRENT_TIMESTAMP"),
        ]
    }
}

/// Phase 2 of database initialization: add columns missing from older stores
pub async fn sync_all_table_schemas(pool: &SqlitePool) -> Result<()> {
    let added = sync_table::<StockVariantTableSchema>(pool).await?
        + sync_table::<SaleRecordTableSchema>(pool).await?;

    if added > 0 {
        info!("Schema synchronization added {} column(s)", added);
    }
    Ok(())
}
