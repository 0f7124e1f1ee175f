//! Batch input: parsing and ingress validation
//!
//! Accepted shapes:
//! - `[ {entry}, ... ]`
//! - `{ "products": [ {entry}, ... ] }`
//! - `{ "products": { "<any key>": {entry}, ... } }` (keys ignored)
//!
//! Each entry is validated on its own. A bad entry becomes a
//! `Validation` error in its slot and never stops the rest of the batch.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

use crate::error::{ReconError, ReconResult};
use crate::matcher::VariantDescriptor;

/// JSON scalar as found in exported snapshots: numbers often arrive as strings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Scalar::Text(s) => s.trim().to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Text(s) if s.trim().is_empty() => Some(0.0),
            Scalar::Text(s) => s.trim().replace(',', ".").parse().ok(),
            Scalar::Int(n) => Some(*n as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Bool(_) => None,
        }
    }
}

/// Entry exactly as it appears in the input
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEntry {
    pub barcode: Option<Scalar>,
    pub name: Option<Scalar>,
    pub brand: Option<Scalar>,
    pub variant_tag: Option<Scalar>,
    pub quantity: Option<Scalar>,
    pub cost_price: Option<Scalar>,
    pub sale_price: Option<Scalar>,
    pub category: Option<Scalar>,
    pub description: Option<Scalar>,
}

/// Validated entry with every default applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEntry {
    pub barcode: String,
    pub name: String,
    pub brand: String,
    pub variant_tag: String,
    pub quantity: i64,
    pub cost_price: f64,
    pub sale_price: f64,
    pub category: String,
    pub description: String,
}

impl VariantDescriptor for BatchEntry {
    /// Incoming identities are never trusted
    fn identity_id(&self) -> &str {
        ""
    }
    fn barcode(&self) -> &str {
        &self.barcode
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn brand(&self) -> &str {
        &self.brand
    }
    fn variant_tag(&self) -> &str {
        &self.variant_tag
    }
}

fn text(field: &Option<Scalar>) -> String {
    field.as_ref().map(Scalar::as_text).unwrap_or_default()
}

fn non_negative_price(field: &Option<Scalar>, label: &str, barcode: &str) -> ReconResult<f64> {
    let Some(raw) = field else {
        return Ok(0.0);
    };
    match raw.as_f64() {
        Some(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(ReconError::Validation(format!(
            "{} {:?} for barcode {} is not a non-negative number",
            label, raw, barcode
        ))),
    }
}

impl RawEntry {
    pub fn validate(&self) -> ReconResult<BatchEntry> {
        let barcode = text(&self.barcode);
        if barcode.is_empty() {
            return Err(ReconError::Validation("entry has a blank barcode".to_string()));
        }

        let name = match text(&self.name) {
            n if n.is_empty() => barcode.clone(),
            n => n,
        };

        let quantity = match &self.quantity {
            None => 0,
            Some(raw) => match raw.as_f64() {
                Some(q) if q.is_finite() && q >= 0.0 && q.fract() == 0.0 => q as i64,
                _ => {
                    return Err(ReconError::Validation(format!(
                        "quantity {:?} for barcode {} is not a non-negative whole number",
                        raw, barcode
                    )))
                }
            },
        };

        Ok(BatchEntry {
            cost_price: non_negative_price(&self.cost_price, "cost_price", &barcode)?,
            sale_price: non_negative_price(&self.sale_price, "sale_price", &barcode)?,
            name,
            brand: text(&self.brand),
            variant_tag: text(&self.variant_tag),
            quantity,
            category: text(&self.category),
            description: text(&self.description),
            barcode,
        })
    }
}

/// Parse a batch document into per-entry validation results, in input order
pub fn parse_batch(json: &str) -> ReconResult<Vec<ReconResult<BatchEntry>>> {
    let document: Value = serde_json::from_str(json)
        .map_err(|e| ReconError::Validation(format!("batch is not valid JSON: {}", e)))?;

    let items: Vec<Value> = match document {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("products") {
            Some(Value::Array(items)) => items,
            Some(Value::Object(keyed)) => keyed.into_iter().map(|(_, v)| v).collect(),
            _ => {
                return Err(ReconError::Validation(
                    "batch object has no products array or map".to_string(),
                ))
            }
        },
        _ => {
            return Err(ReconError::Validation(
                "batch must be an array or an object with a products field".to_string(),
            ))
        }
    };

    Ok(items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawEntry>(item)
                .map_err(|e| ReconError::Validation(format!("malformed entry: {}", e)))
                .and_then(|raw| raw.validate())
        })
        .collect())
}

pub fn load_batch_file(path: &Path) -> ReconResult<Vec<ReconResult<BatchEntry>>> {
    let content = std::fs::read_to_string(path).map_err(stokid_common::Error::Io)?;
    parse_batch(&content)
}
