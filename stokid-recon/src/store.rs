//! Identity Store service
//!
//! The only code that touches `stock_variant` and `sale_record` rows.
//! Reads go through the pool; every write takes a caller-owned connection
//! so the caller decides the transaction boundary.

use sqlx::{SqliteConnection, SqlitePool};
use stokid_common::db::{
    get_setting_or, NewSaleRecord, SaleRecord, StockVariant, VariantDraft,
    SETTING_MAX_LOCK_WAIT_MS,
};
use stokid_common::{Error, Result};

use crate::utils::{begin_monitored, retry_on_lock, MonitoredTransaction};

/// Default for `db_max_lock_wait_ms` when the setting is unreadable
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Field-level update for an existing variant. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillUpdate {
    pub quantity_delta: i64,
    pub cost_price: Option<f64>,
    pub sale_price: Option<f64>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
}

impl FillUpdate {
    pub fn is_noop(&self) -> bool {
        self.quantity_delta == 0
            && self.cost_price.is_none()
            && self.sale_price.is_none()
            && self.name.is_none()
            && self.brand.is_none()
            && self.category.is_none()
            && self.description.is_none()
    }
}

fn variant_query(filter: &str) -> String {
    format!("SELECT {} FROM stock_variant {}", StockVariant::COLUMNS, filter)
}

fn sale_query(filter: &str) -> String {
    format!("SELECT {} FROM sale_record {}", SaleRecord::COLUMNS, filter)
}

/// Identity Store service
#[derive(Clone)]
pub struct IdentityStore {
    db: SqlitePool,
}

impl IdentityStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Open a monitored transaction for one unit of work
    pub async fn begin(&self, caller: &'static str) -> Result<MonitoredTransaction> {
        begin_monitored(&self.db, caller).await
    }

    /// Retry budget for a single unit of work
    pub async fn max_lock_wait_ms(&self) -> u64 {
        match get_setting_or(&self.db, SETTING_MAX_LOCK_WAIT_MS, DEFAULT_MAX_LOCK_WAIT_MS).await {
            Ok(ms) => ms,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read lock wait setting, using default");
                DEFAULT_MAX_LOCK_WAIT_MS
            }
        }
    }

    // ------------------------------------------------------------------
    // Pool reads
    // ------------------------------------------------------------------

    /// Every live variant, earliest-created first
    pub async fn live_variants(&self) -> Result<Vec<StockVariant>> {
        let rows = sqlx::query_as(&variant_query("ORDER BY seq"))
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    pub async fn variants_with_barcode(&self, barcode: &str) -> Result<Vec<StockVariant>> {
        let rows = sqlx::query_as(&variant_query("WHERE barcode = ? ORDER BY seq"))
            .bind(barcode.trim())
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    /// Live variants with the barcode and stock left to sell
    pub async fn in_stock_with_barcode(&self, barcode: &str) -> Result<Vec<StockVariant>> {
        let rows = sqlx::query_as(&variant_query(
            "WHERE barcode = ? AND quantity_on_hand > 0 ORDER BY seq",
        ))
        .bind(barcode.trim())
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn find_variant(&self, identity_id: &str) -> Result<Option<StockVariant>> {
        let row = sqlx::query_as(&variant_query("WHERE identity_id = ?"))
            .bind(identity_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    pub async fn find_sale(&self, sale_id: i64) -> Result<Option<SaleRecord>> {
        let row = sqlx::query_as(&sale_query("WHERE sale_id = ?"))
            .bind(sale_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    /// Sale records with an empty identity, optionally limited to one barcode
    pub async fn sales_missing_identity(&self, barcode: Option<&str>) -> Result<Vec<SaleRecord>> {
        let rows = match barcode {
            Some(barcode) => {
                sqlx::query_as(&sale_query(
                    "WHERE COALESCE(identity_id, '') = '' AND barcode = ? ORDER BY sale_id",
                ))
                .bind(barcode.trim())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as(&sale_query("WHERE COALESCE(identity_id, '') = '' ORDER BY sale_id"))
                    .fetch_all(&self.db)
                    .await?
            }
        };
        Ok(rows)
    }

    /// Distinct barcodes that still have sales without an identity
    pub async fn barcodes_missing_sale_identity(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            "SELECT DISTINCT barcode FROM sale_record WHERE COALESCE(identity_id, '') = '' ORDER BY 1",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// `(sale_id, identity_id)` of every sale pointing at a missing variant
    pub async fn dangling_sale_references(&self) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query_as(
            r#"
            SELECT s.sale_id, s.identity_id
            FROM sale_record s
            LEFT JOIN stock_variant v ON v.identity_id = s.identity_id
            WHERE COALESCE(s.identity_id, '') != '' AND v.seq IS NULL
            ORDER BY s.sale_id
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Give legacy rows without an identity a fresh one
    pub async fn assign_missing_identities(&self) -> Result<u64> {
        let max_wait_ms = self.max_lock_wait_ms().await;
        let assigned = retry_on_lock("assign identities", max_wait_ms, || {
            stokid_common::db::assign_missing_identities(&self.db)
        })
        .await?;

        tracing::info!(assigned, "Identity assignment complete");
        Ok(assigned)
    }

    // ------------------------------------------------------------------
    // Transaction-scoped reads and writes
    // ------------------------------------------------------------------

    pub async fn load_variant(
        conn: &mut SqliteConnection,
        identity_id: &str,
    ) -> Result<Option<StockVariant>> {
        let row = sqlx::query_as(&variant_query("WHERE identity_id = ?"))
            .bind(identity_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    pub async fn load_live_variants(conn: &mut SqliteConnection) -> Result<Vec<StockVariant>> {
        let rows = sqlx::query_as(&variant_query("ORDER BY seq"))
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows)
    }

    pub async fn load_variants_with_barcode(
        conn: &mut SqliteConnection,
        barcode: &str,
    ) -> Result<Vec<StockVariant>> {
        let rows = sqlx::query_as(&variant_query("WHERE barcode = ? ORDER BY seq"))
            .bind(barcode.trim())
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows)
    }

    pub async fn load_sale(conn: &mut SqliteConnection, sale_id: i64) -> Result<Option<SaleRecord>> {
        let row = sqlx::query_as(&sale_query("WHERE sale_id = ?"))
            .bind(sale_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// Insert a new variant under a freshly generated identity
    pub async fn insert_variant(
        conn: &mut SqliteConnection,
        draft: &VariantDraft,
    ) -> Result<StockVariant> {
        let identity_id = stokid_common::identity::generate();

        sqlx::query(
            r#"
            INSERT INTO stock_variant (
                identity_id, barcode, name, brand, variant_tag, category, description,
                quantity_on_hand, cost_price, sale_price
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&identity_id)
        .bind(draft.barcode.trim())
        .bind(draft.name.trim())
        .bind(draft.brand.trim())
        .bind(draft.variant_tag.trim())
        .bind(&draft.category)
        .bind(&draft.description)
        .bind(draft.quantity)
        .bind(draft.cost_price)
        .bind(draft.sale_price)
        .execute(&mut *conn)
        .await?;

        Self::load_variant(conn, &identity_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("Inserted variant {} not readable", identity_id)))
    }

    /// Apply a fill update; errors with NotFound when the row is gone
    pub async fn apply_fill(
        conn: &mut SqliteConnection,
        identity_id: &str,
        update: &FillUpdate,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stock_variant SET
                quantity_on_hand = quantity_on_hand + ?,
                cost_price = COALESCE(?, cost_price),
                sale_price = COALESCE(?, sale_price),
                name = COALESCE(?, name),
                brand = COALESCE(?, brand),
                category = COALESCE(?, category),
                description = COALESCE(?, description),
                updated_at = CURRENT_TIMESTAMP
            WHERE identity_id = ?
            "#,
        )
        .bind(update.quantity_delta)
        .bind(update.cost_price)
        .bind(update.sale_price)
        .bind(update.name.as_deref())
        .bind(update.brand.as_deref())
        .bind(update.category.as_deref())
        .bind(update.description.as_deref())
        .bind(identity_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("stock variant {}", identity_id)));
        }
        Ok(())
    }

    pub async fn set_quantity(
        conn: &mut SqliteConnection,
        identity_id: &str,
        quantity: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE stock_variant SET quantity_on_hand = ?, updated_at = CURRENT_TIMESTAMP WHERE identity_id = ?",
        )
        .bind(quantity)
        .bind(identity_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("stock variant {}", identity_id)));
        }
        Ok(())
    }

    /// Add `delta` (possibly negative) to the on-hand quantity.
    ///
    /// Refuses to take the quantity below zero.
    pub async fn adjust_quantity(
        conn: &mut SqliteConnection,
        identity_id: &str,
        delta: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stock_variant
            SET quantity_on_hand = quantity_on_hand + ?, updated_at = CURRENT_TIMESTAMP
            WHERE identity_id = ? AND quantity_on_hand + ? >= 0
            "#,
        )
        .bind(delta)
        .bind(identity_id)
        .bind(delta)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidInput(format!(
                "cannot adjust {} by {}: row missing or quantity would go negative",
                identity_id, delta
            )));
        }
        Ok(())
    }

    pub async fn delete_variant(conn: &mut SqliteConnection, identity_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM stock_variant WHERE identity_id = ?")
            .bind(identity_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Point every sale of `from` at `to`; returns the number of sales moved
    pub async fn repoint_sales(conn: &mut SqliteConnection, from: &str, to: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE sale_record SET identity_id = ? WHERE identity_id = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Fill in a sale's identity. Only succeeds while the identity is still empty.
    pub async fn set_sale_identity(
        conn: &mut SqliteConnection,
        sale_id: i64,
        identity_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sale_record SET identity_id = ? WHERE sale_id = ? AND COALESCE(identity_id, '') = ''",
        )
        .bind(identity_id)
        .bind(sale_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_sale(conn: &mut SqliteConnection, sale: &NewSaleRecord) -> Result<SaleRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO sale_record (
                barcode, product_name, brand, identity_id, quantity, unit_price,
                cost_price_snapshot, total, is_debt, timestamp, customer_id, customer_name
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sale.barcode.trim())
        .bind(&sale.product_name)
        .bind(&sale.brand)
        .bind(&sale.identity_id)
        .bind(sale.quantity)
        .bind(sale.unit_price)
        .bind(sale.cost_price_snapshot)
        .bind(sale.total())
        .bind(sale.is_debt)
        .bind(sale.timestamp)
        .bind(&sale.customer_id)
        .bind(&sale.customer_name)
        .execute(&mut *conn)
        .await?;

        let sale_id = result.last_insert_rowid();
        Self::load_sale(conn, sale_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("Inserted sale {} not readable", sale_id)))
    }

    pub async fn delete_sale(conn: &mut SqliteConnection, sale_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sale_record WHERE sale_id = ?")
            .bind(sale_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}
