//! Sale-time variant resolution
//!
//! A scanned barcode resolves to exactly one in-stock variant, to none
//! (`NoStockAvailable`), or to several, in which case the caller must pick
//! one explicitly before anything is written. The resolver never guesses.
//!
//! After a sale commits, historical sales of the same barcode that lack an
//! identity are backfilled when tiers 2-3 give a single answer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use stokid_common::db::{NewSaleRecord, SaleRecord, StockVariant, VariantDraft};

use crate::error::{Candidate, ReconError, ReconResult};
use crate::matcher::{match_variant, MatchOutcome, MatchPolicy};
use crate::store::IdentityStore;
use crate::utils::retry_on_lock;

/// Outcome of a barcode lookup with stock on hand
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(StockVariant),
    Ambiguous {
        barcode: String,
        candidates: Vec<StockVariant>,
    },
}

impl Resolution {
    /// The single variant, or `Ambiguity` listing every candidate
    pub fn into_single(self) -> ReconResult<StockVariant> {
        match self {
            Resolution::Resolved(variant) => Ok(variant),
            Resolution::Ambiguous { barcode, candidates } => Err(ReconError::Ambiguity {
                barcode,
                candidates: candidates.iter().map(Candidate::from).collect(),
            }),
        }
    }
}

/// Everything about a sale line except which variant it sells
#[derive(Debug, Clone, PartialEq)]
pub struct SaleRequest {
    pub quantity: i64,
    pub unit_price: f64,
    /// Defaults to the variant's current cost price
    pub cost_price: Option<f64>,
    pub is_debt: bool,
    pub customer_id: String,
    pub customer_name: String,
    /// Defaults to now
    pub timestamp: Option<DateTime<Utc>>,
}

impl SaleRequest {
    pub fn new(quantity: i64, unit_price: f64) -> Self {
        Self {
            quantity,
            unit_price,
            cost_price: None,
            is_debt: false,
            customer_id: String::new(),
            customer_name: String::new(),
            timestamp: None,
        }
    }

    fn validate(&self) -> ReconResult<()> {
        if self.quantity <= 0 {
            return Err(ReconError::Validation(format!(
                "sale quantity must be positive, got {}",
                self.quantity
            )));
        }
        if !(self.unit_price.is_finite() && self.unit_price >= 0.0) {
            return Err(ReconError::Validation(format!(
                "unit price must be non-negative, got {}",
                self.unit_price
            )));
        }
        Ok(())
    }
}

/// Result of reversing a sale
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reversal {
    pub sale_id: i64,
    pub identity_id: String,
    pub restored_quantity: i64,
    /// No live variant existed; one was re-created from the sale snapshot
    pub recreated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub examined: usize,
    pub updated: usize,
    /// Ambiguous or unmatched against the current pool
    pub unresolved: usize,
}

impl BackfillReport {
    fn absorb(&mut self, other: &BackfillReport) {
        self.examined += other.examined;
        self.updated += other.updated;
        self.unresolved += other.unresolved;
    }
}

/// States of a single sale attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SaleState {
    Scanned { barcode: String },
    NoStock { barcode: String },
    SingleCandidate(StockVariant),
    MultiCandidate { barcode: String, candidates: Vec<StockVariant> },
    AwaitingSelection { barcode: String, candidates: Vec<StockVariant> },
    Resolved(StockVariant),
    Abandoned { barcode: String },
}

impl SaleState {
    fn name(&self) -> &'static str {
        match self {
            SaleState::Scanned { .. } => "scanned",
            SaleState::NoStock { .. } => "no_stock",
            SaleState::SingleCandidate(_) => "single_candidate",
            SaleState::MultiCandidate { .. } => "multi_candidate",
            SaleState::AwaitingSelection { .. } => "awaiting_selection",
            SaleState::Resolved(_) => "resolved",
            SaleState::Abandoned { .. } => "abandoned",
        }
    }
}

/// One pass through `Scanned -> ... -> Resolved | NoStock | Abandoned`.
///
/// No transaction is open while the attempt waits for a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleAttempt {
    state: SaleState,
}

impl SaleAttempt {
    pub fn scan(barcode: impl Into<String>) -> Self {
        Self {
            state: SaleState::Scanned {
                barcode: barcode.into().trim().to_string(),
            },
        }
    }

    pub fn state(&self) -> &SaleState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SaleState::NoStock { .. } | SaleState::Resolved(_) | SaleState::Abandoned { .. }
        )
    }

    pub fn resolved(&self) -> Option<&StockVariant> {
        match &self.state {
            SaleState::Resolved(variant) => Some(variant),
            _ => None,
        }
    }

    fn invalid(&self, action: &str) -> ReconError {
        ReconError::Validation(format!("cannot {} a sale attempt in state {}", action, self.state.name()))
    }

    /// Scanned -> NoStock | SingleCandidate | MultiCandidate
    pub async fn lookup(self, resolver: &SaleResolver) -> ReconResult<Self> {
        let SaleState::Scanned { barcode } = &self.state else {
            return Err(self.invalid("look up"));
        };

        let state = match resolver.resolve(barcode).await {
            Ok(Resolution::Resolved(variant)) => SaleState::SingleCandidate(variant),
            Ok(Resolution::Ambiguous { barcode, candidates }) => {
                SaleState::MultiCandidate { barcode, candidates }
            }
            Err(ReconError::NoStockAvailable { barcode }) => SaleState::NoStock { barcode },
            Err(err) => return Err(err),
        };
        Ok(Self { state })
    }

    /// SingleCandidate -> Resolved, MultiCandidate -> AwaitingSelection
    pub fn proceed(self) -> ReconResult<Self> {
        let state = match self.state {
            SaleState::SingleCandidate(variant) => SaleState::Resolved(variant),
            SaleState::MultiCandidate { barcode, candidates } => {
                SaleState::AwaitingSelection { barcode, candidates }
            }
            _ => return Err(self.invalid("proceed with")),
        };
        Ok(Self { state })
    }

    /// AwaitingSelection -> Resolved, after re-checking the choice against live stock
    pub async fn select(self, resolver: &SaleResolver, identity_id: &str) -> ReconResult<Self> {
        let SaleState::AwaitingSelection { barcode, .. } = &self.state else {
            return Err(self.invalid("select in"));
        };
        let variant = resolver.select(barcode, identity_id).await?;
        Ok(Self {
            state: SaleState::Resolved(variant),
        })
    }

    /// AwaitingSelection -> Abandoned
    pub fn abandon(self) -> ReconResult<Self> {
        match self.state {
            SaleState::AwaitingSelection { barcode, .. } => Ok(Self {
                state: SaleState::Abandoned { barcode },
            }),
            _ => Err(self.invalid("abandon")),
        }
    }
}

/// Sale Resolver
pub struct SaleResolver {
    store: IdentityStore,
}

impl SaleResolver {
    pub fn new(store: IdentityStore) -> Self {
        Self { store }
    }

    /// Look up the in-stock variants for a scanned barcode
    pub async fn resolve(&self, barcode: &str) -> ReconResult<Resolution> {
        let barcode = barcode.trim();
        if barcode.is_empty() {
            return Err(ReconError::Validation("blank barcode".to_string()));
        }

        let mut candidates = self.store.in_stock_with_barcode(barcode).await?;
        match candidates.len() {
            0 => {
                tracing::info!(barcode = %barcode, "No stock available");
                Err(ReconError::NoStockAvailable {
                    barcode: barcode.to_string(),
                })
            }
            1 => {
                let variant = candidates.remove(0);
                tracing::debug!(barcode = %barcode, identity_id = %variant.identity_id, "Barcode resolved");
                Ok(Resolution::Resolved(variant))
            }
            n => {
                tracing::info!(barcode = %barcode, candidates = n, "Barcode ambiguous, selection required");
                Ok(Resolution::Ambiguous {
                    barcode: barcode.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Confirm an explicit choice: it must be a live in-stock variant of `barcode`
    pub async fn select(&self, barcode: &str, identity_id: &str) -> ReconResult<StockVariant> {
        let candidates = self.store.in_stock_with_barcode(barcode).await?;
        if candidates.is_empty() {
            return Err(ReconError::NoStockAvailable {
                barcode: barcode.trim().to_string(),
            });
        }
        candidates
            .into_iter()
            .find(|v| v.identity_id == identity_id.trim())
            .ok_or_else(|| ReconError::UnknownSelection {
                barcode: barcode.trim().to_string(),
                identity_id: identity_id.to_string(),
            })
    }

    /// Record a sale of the resolved variant.
    ///
    /// Decrement and sale insert share one transaction. Backfill for the
    /// barcode runs afterwards; its failure is logged and does not undo
    /// the sale.
    pub async fn complete_sale(
        &self,
        variant: &StockVariant,
        request: &SaleRequest,
    ) -> ReconResult<SaleRecord> {
        request.validate()?;

        let max_wait_ms = self.store.max_lock_wait_ms().await;
        let sale = retry_on_lock("complete sale", max_wait_ms, || self.record_sale(variant, request))
            .await?;

        tracing::info!(
            sale_id = sale.sale_id,
            barcode = %sale.barcode,
            identity_id = %sale.identity_id,
            quantity = sale.quantity,
            total = sale.total,
            "Sale recorded"
        );

        if let Err(err) = self.backfill(&variant.barcode).await {
            tracing::warn!(barcode = %variant.barcode, error = %err, "Backfill after sale failed");
        }

        Ok(sale)
    }

    async fn record_sale(&self, chosen: &StockVariant, request: &SaleRequest) -> ReconResult<SaleRecord> {
        let mut tx = self.store.begin("sale_resolver::complete_sale").await?;

        let current = IdentityStore::load_variant(&mut **tx.inner_mut(), &chosen.identity_id)
            .await?
            .filter(|v| v.quantity_on_hand > 0)
            .ok_or_else(|| ReconError::NoStockAvailable {
                barcode: chosen.barcode.clone(),
            })?;

        if current.quantity_on_hand < request.quantity {
            return Err(ReconError::InsufficientStock {
                identity_id: current.identity_id.clone(),
                requested: request.quantity,
                available: current.quantity_on_hand,
            });
        }

        IdentityStore::adjust_quantity(&mut **tx.inner_mut(), &current.identity_id, -request.quantity)
            .await?;

        let snapshot = NewSaleRecord {
            barcode: current.barcode.clone(),
            product_name: current.name.clone(),
            brand: current.brand.clone(),
            identity_id: current.identity_id.clone(),
            quantity: request.quantity,
            unit_price: request.unit_price,
            cost_price_snapshot: request.cost_price.unwrap_or(current.cost_price),
            is_debt: request.is_debt,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
            customer_id: request.customer_id.clone(),
            customer_name: request.customer_name.clone(),
        };
        let sale = IdentityStore::insert_sale(&mut **tx.inner_mut(), &snapshot).await?;

        tx.commit().await?;
        Ok(sale)
    }

    /// Undo a sale: put its quantity back on the variant it sold, then
    /// delete the record.
    ///
    /// A legacy sale without an identity is resolved with every matcher
    /// tier. If no live variant carries the barcode, one is re-created
    /// from the sale snapshot. An ambiguous lookup aborts with `Ambiguity`.
    pub async fn reverse_sale(&self, sale_id: i64) -> ReconResult<Reversal> {
        let max_wait_ms = self.store.max_lock_wait_ms().await;
        let reversal = retry_on_lock("reverse sale", max_wait_ms, || self.reverse_once(sale_id)).await?;

        tracing::info!(
            sale_id,
            identity_id = %reversal.identity_id,
            restored = reversal.restored_quantity,
            recreated = reversal.recreated,
            "Sale reversed"
        );
        Ok(reversal)
    }

    async fn reverse_once(&self, sale_id: i64) -> ReconResult<Reversal> {
        let mut tx = self.store.begin("sale_resolver::reverse_sale").await?;

        let sale = IdentityStore::load_sale(&mut **tx.inner_mut(), sale_id)
            .await?
            .ok_or(ReconError::SaleNotFound(sale_id))?;

        let pool = IdentityStore::load_variants_with_barcode(&mut **tx.inner_mut(), &sale.barcode).await?;

        let (identity_id, recreated) = match match_variant(&sale, &pool, MatchPolicy::FULL) {
            MatchOutcome::Matched { identity_id, .. } => {
                IdentityStore::adjust_quantity(&mut **tx.inner_mut(), &identity_id, sale.quantity).await?;
                (identity_id, false)
            }
            MatchOutcome::Unmatched => {
                if !sale.identity_id.is_empty() {
                    tracing::warn!(
                        sale_id,
                        identity_id = %sale.identity_id,
                        "Sale references a missing variant, re-creating from snapshot"
                    );
                }
                let draft = VariantDraft {
                    barcode: sale.barcode.clone(),
                    name: sale.product_name.clone(),
                    brand: sale.brand.clone(),
                    quantity: sale.quantity,
                    cost_price: sale.cost_price_snapshot,
                    sale_price: sale.unit_price,
                    ..Default::default()
                };
                let created = IdentityStore::insert_variant(&mut **tx.inner_mut(), &draft).await?;
                (created.identity_id, true)
            }
            MatchOutcome::Ambiguous { identity_ids } => {
                let candidates = pool
                    .iter()
                    .filter(|v| identity_ids.contains(&v.identity_id))
                    .map(Candidate::from)
                    .collect();
                return Err(ReconError::Ambiguity {
                    barcode: sale.barcode.clone(),
                    candidates,
                });
            }
        };

        IdentityStore::delete_sale(&mut **tx.inner_mut(), sale_id).await?;
        tx.commit().await?;

        Ok(Reversal {
            sale_id,
            identity_id,
            restored_quantity: sale.quantity,
            recreated,
        })
    }

    /// Fill in missing identities on sales of `barcode` where tiers 2-3
    /// single out one live variant. Ambiguous sales are left alone.
    pub async fn backfill(&self, barcode: &str) -> ReconResult<BackfillReport> {
        let sales = self.store.sales_missing_identity(Some(barcode)).await?;
        if sales.is_empty() {
            return Ok(BackfillReport::default());
        }
        let pool = self.store.variants_with_barcode(barcode).await?;

        let mut report = BackfillReport {
            examined: sales.len(),
            ..Default::default()
        };
        let mut assignments = Vec::new();
        for sale in &sales {
            match match_variant(sale, &pool, MatchPolicy::DESCRIPTIVE) {
                MatchOutcome::Matched { identity_id, .. } => assignments.push((sale.sale_id, identity_id)),
                _ => report.unresolved += 1,
            }
        }

        if !assignments.is_empty() {
            let max_wait_ms = self.store.max_lock_wait_ms().await;
            let assignments = &assignments;
            let updated = retry_on_lock("backfill sales", max_wait_ms, || async move {
                let mut tx = self.store.begin("sale_resolver::backfill").await?;
                let mut updated = 0usize;
                for (sale_id, identity_id) in assignments {
                    // The variant may have been merged away since the pool was read
                    if IdentityStore::load_variant(&mut **tx.inner_mut(), identity_id).await?.is_none() {
                        continue;
                    }
                    if IdentityStore::set_sale_identity(&mut **tx.inner_mut(), *sale_id, identity_id).await? {
                        updated += 1;
                    }
                }
                tx.commit().await?;
                Ok::<_, ReconError>(updated)
            })
            .await?;

            report.updated = updated;
            report.unresolved += assignments.len() - updated;
        }

        tracing::debug!(
            barcode = %barcode,
            examined = report.examined,
            updated = report.updated,
            unresolved = report.unresolved,
            "Backfill done"
        );
        Ok(report)
    }

    /// Backfill every barcode that still has sales without an identity
    pub async fn backfill_all(&self) -> ReconResult<BackfillReport> {
        let barcodes = self.store.barcodes_missing_sale_identity().await?;
        let mut total = BackfillReport::default();

        for barcode in &barcodes {
            match self.backfill(barcode).await {
                Ok(report) => total.absorb(&report),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(barcode = %barcode, error = %err, "Backfill skipped barcode");
                }
            }
        }

        tracing::info!(
            barcodes = barcodes.len(),
            examined = total.examined,
            updated = total.updated,
            unresolved = total.unresolved,
            "Bulk backfill complete"
        );
        Ok(total)
    }
}
