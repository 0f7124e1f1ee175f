//! Error types for the reconciliation engine
//!
//! Per-entry and per-group failures are counted by the pass that hit
//! them. Only [`ReconError::is_fatal`] errors abort a whole pass.

use serde::Serialize;
use thiserror::Error;

/// One live variant offered to the operator when a barcode is ambiguous
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub identity_id: String,
    pub name: String,
    pub brand: String,
    pub variant_tag: String,
    pub quantity_on_hand: i64,
    pub sale_price: f64,
}

impl From<&stokid_common::db::StockVariant> for Candidate {
    fn from(v: &stokid_common::db::StockVariant) -> Self {
        Self {
            identity_id: v.identity_id.clone(),
            name: v.name.clone(),
            brand: v.brand.clone(),
            variant_tag: v.variant_tag.clone(),
            quantity_on_hand: v.quantity_on_hand,
            sale_price: v.sale_price,
        }
    }
}

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum ReconError {
    /// Input rejected at ingress (blank barcode, negative quantity)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Barcode resolves to several live variants; an explicit choice is required
    #[error("Barcode {barcode} matches {} live variants, a selection is required", candidates.len())]
    Ambiguity {
        barcode: String,
        candidates: Vec<Candidate>,
    },

    /// Duplicate group changed between detection and merge
    #[error("Merge conflict on {identity_id}: {reason}")]
    MergeConflict { identity_id: String, reason: String },

    /// Sale record points at a stock variant that does not exist
    #[error("Sale {sale_id} references missing identity {identity_id}")]
    Referential { sale_id: i64, identity_id: String },

    /// No live variant with stock for the barcode
    #[error("No stock available for barcode {barcode}")]
    NoStockAvailable { barcode: String },

    #[error("Insufficient stock for {identity_id}: requested {requested}, available {available}")]
    InsufficientStock {
        identity_id: String,
        requested: i64,
        available: i64,
    },

    /// Selected identity is not among the live candidates for the barcode
    #[error("Identity {identity_id} is not a live variant of barcode {barcode}")]
    UnknownSelection { barcode: String, identity_id: String },

    #[error("Sale record not found: {0}")]
    SaleNotFound(i64),

    #[error(transparent)]
    Store(#[from] stokid_common::Error),
}

impl From<sqlx::Error> for ReconError {
    fn from(err: sqlx::Error) -> Self {
        ReconError::Store(stokid_common::Error::Database(err))
    }
}

impl ReconError {
    /// True when the store is unreachable and the whole pass must stop
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconError::Store(err) => err.is_store_unavailable(),
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type ReconResult<T> = Result<T, ReconError>;
