//! Tiered variant matching
//!
//! Pure functions shared by the deduplicator, the batch reconciler and
//! the sale resolver. Every caller must go through here so that merge,
//! import and sale-time lookups agree on what "the same variant" means.
//!
//! Tiers, in priority order (first tier yielding exactly one candidate wins):
//! 1. Same non-empty identity_id
//! 2. Barcode + brand + variant_tag (brand and tag case-insensitive, blank = none)
//! 3. Barcode + name (name case-sensitive)
//! 4. Barcode only, when exactly one live variant carries it

use serde::Serialize;
use stokid_common::db::{SaleRecord, StockVariant};

/// Read access to the fields matching looks at
pub trait VariantDescriptor {
    fn identity_id(&self) -> &str;
    fn barcode(&self) -> &str;
    fn name(&self) -> &str;
    fn brand(&self) -> &str;
    fn variant_tag(&self) -> &str;
}

impl VariantDescriptor for StockVariant {
    fn identity_id(&self) -> &str {
        &self.identity_id
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

/// A sale carries a snapshot of name and brand but no variant tag
impl VariantDescriptor for SaleRecord {
    fn identity_id(&self) -> &str {
        &self.identity_id
    }
    fn barcode(&self) -> &str {
        &self.barcode
    }
    fn name(&self) -> &str {
        &self.product_name
    }
    fn brand(&self) -> &str {
        &self.brand
    }
    fn variant_tag(&self) -> &str {
        ""
    }
}

/// Normalized duplicate-group key: `(barcode, name, lower(brand))`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VariantKey {
    pub barcode: String,
    pub name: String,
    pub brand: String,
}

impl VariantKey {
    pub fn of<D: VariantDescriptor + ?Sized>(d: &D) -> Self {
        Self {
            barcode: normalize_barcode(d.barcode()).to_string(),
            name: d.name().trim().to_string(),
            brand: normalize_label(d.brand()),
        }
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.barcode, self.name, self.brand)
    }
}

pub fn normalize_barcode(barcode: &str) -> &str {
    barcode.trim()
}

/// Brand and variant tag: trimmed, lowercased; NULL and '' both become ''
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Identity,
    BarcodeBrandVariant,
    BarcodeName,
    BarcodeOnly,
}

/// Which tiers a caller evaluates, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    tiers: &'static [Tier],
}

impl MatchPolicy {
    /// All four tiers: sale-time lookups and returns
    pub const FULL: MatchPolicy = MatchPolicy {
        tiers: &[
            Tier::Identity,
            Tier::BarcodeBrandVariant,
            Tier::BarcodeName,
            Tier::BarcodeOnly,
        ],
    };

    /// Tiers 2-3 only. Batch reconciliation and sale backfill never trust
    /// a bare barcode or an incoming identity.
    pub const DESCRIPTIVE: MatchPolicy = MatchPolicy {
        tiers: &[Tier::BarcodeBrandVariant, Tier::BarcodeName],
    };

    pub fn tiers(&self) -> &'static [Tier] {
        self.tiers
    }
}

/// Result of matching one description against the live pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { identity_id: String, tier: Tier },
    Unmatched,
    /// No tier decided and several live variants share the barcode
    Ambiguous { identity_ids: Vec<String> },
}

impl MatchOutcome {
    pub fn matched_identity(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched { identity_id, .. } => Some(identity_id),
            _ => None,
        }
    }
}

fn tier_accepts<C, V>(tier: Tier, candidate: &C, variant: &V) -> bool
where
    C: VariantDescriptor + ?Sized,
    V: VariantDescriptor,
{
    let same_barcode =
        || normalize_barcode(candidate.barcode()) == normalize_barcode(variant.barcode());

    match tier {
        Tier::Identity => {
            let id = candidate.identity_id().trim();
            !id.is_empty() && id == variant.identity_id().trim()
        }
        Tier::BarcodeBrandVariant => {
            same_barcode()
                && normalize_label(candidate.brand()) == normalize_label(variant.brand())
                && normalize_label(candidate.variant_tag()) == normalize_label(variant.variant_tag())
        }
        Tier::BarcodeName => same_barcode() && candidate.name().trim() == variant.name().trim(),
        // Uniqueness of the barcode is checked by the caller
        Tier::BarcodeOnly => same_barcode(),
    }
}

/// Match `candidate` against the live `pool` under `policy`.
///
/// A tier with several hits is "no decision" and evaluation falls
/// through. `Ambiguous` is returned only when nothing resolved and at
/// least two live variants share the candidate's barcode; it lists them
/// in pool order.
pub fn match_variant<C, V>(candidate: &C, pool: &[V], policy: MatchPolicy) -> MatchOutcome
where
    C: VariantDescriptor + ?Sized,
    V: VariantDescriptor,
{
    for &tier in policy.tiers() {
        let mut hits = pool.iter().filter(|v| tier_accepts(tier, candidate, *v));
        let first = hits.next();
        let more = hits.next().is_some();

        match (first, more) {
            (Some(variant), false) => {
                return MatchOutcome::Matched {
                    identity_id: variant.identity_id().to_string(),
                    tier,
                };
            }
            (Some(_), true) => {
                tracing::trace!(?tier, barcode = %candidate.barcode(), "Tier undecided, falling through");
            }
            (None, _) => {}
        }
    }

    let sharing: Vec<String> = pool
        .iter()
        .filter(|v| tier_accepts(Tier::BarcodeOnly, candidate, *v))
        .map(|v| v.identity_id().to_string())
        .collect();

    if sharing.len() >= 2 {
        MatchOutcome::Ambiguous { identity_ids: sharing }
    } else {
        MatchOutcome::Unmatched
    }
}
