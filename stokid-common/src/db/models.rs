//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sellable variant (`stock_variant` row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StockVariant {
    /// Internal row ordinal; earliest-created rows have the lowest value
    pub seq: i64,
    pub identity_id: String,
    pub barcode: String,
    pub name: String,
    /// Empty string means "no brand"
    pub brand: String,
    /// Empty string means "no variant"
    pub variant_tag: String,
    pub category: String,
    pub description: String,
    pub quantity_on_hand: i64,
    pub cost_price: f64,
    pub sale_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockVariant {
    /// Column list for `SELECT ... FROM stock_variant`, NULL text folded to ''
    pub const COLUMNS: &'static str = "seq, COALESCE(identity_id, '') AS identity_id, barcode, \
        name, COALESCE(brand, '') AS brand, COALESCE(variant_tag, '') AS variant_tag, \
        COALESCE(category, '') AS category, COALESCE(description, '') AS description, \
        quantity_on_hand, cost_price, sale_price, \
        COALESCE(created_at, CURRENT_TIMESTAMP) AS created_at, \
        COALESCE(updated_at, created_at, CURRENT_TIMESTAMP) AS updated_at";
}

/// Values for a stock variant that does not exist yet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantDraft {
    pub barcode: String,
    pub name: String,
    pub brand: String,
    pub variant_tag: String,
    pub category: String,
    pub description: String,
    pub quantity: i64,
    pub cost_price: f64,
    pub sale_price: f64,
}

/// One historical sale line (`sale_record` row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SaleRecord {
    pub sale_id: i64,
    pub barcode: String,
    /// Snapshot at sale time, not joined live
    pub product_name: String,
    pub brand: String,
    /// Empty for legacy records until backfilled
    pub identity_id: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub cost_price_snapshot: f64,
    pub total: f64,
    pub is_debt: bool,
    pub timestamp: DateTime<Utc>,
    pub customer_id: String,
    pub customer_name: String,
    pub created_at: DateTime<Utc>,
}

impl SaleRecord {
    /// Column list for `SELECT ... FROM sale_record`, NULL text folded to ''
    pub const COLUMNS: &'static str = "sale_id, barcode, COALESCE(product_name, '') AS product_name, \
        COALESCE(brand, '') AS brand, COALESCE(identity_id, '') AS identity_id, quantity, \
        unit_price, cost_price_snapshot, total, is_debt, timestamp, \
        COALESCE(customer_id, '') AS customer_id, COALESCE(customer_name, '') AS customer_name, \
        COALESCE(created_at, timestamp) AS created_at";
}

/// Values for a sale line about to be inserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSaleRecord {
    pub barcode: String,
    pub product_name: String,
    pub brand: String,
    pub identity_id: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub cost_price_snapshot: f64,
    pub is_debt: bool,
    pub timestamp: DateTime<Utc>,
    pub customer_id: String,
    pub customer_name: String,
}

impl NewSaleRecord {
    pub fn total(&self) -> f64 {
        self.unit_price * self.quantity as f64
    }
}
