//! Batch reconciliation
//!
//! Merges an external batch (import file, backup snapshot) into the live
//! store. Each entry is matched on tiers 2-3 only:
//! - Matched: additive-and-fill update (quantity added, prices replaced
//!   only when > 0, text replaced only when non-empty)
//! - Unmatched or Ambiguous: inserted as a new variant with a fresh identity
//!
//! Entries applied earlier in the batch are visible to later ones, so a
//! batch never duplicates itself.

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use stokid_common::config::BatchMode;
use stokid_common::db::{StockVariant, VariantDraft};

use crate::batch::BatchEntry;
use crate::error::{ReconError, ReconResult};
use crate::matcher::{match_variant, normalize_label, MatchOutcome, MatchPolicy};
use crate::store::{FillUpdate, IdentityStore};
use crate::utils::{retry_on_lock, LockContention};

/// Counts for one batch. `inserted + updated + skipped == total`;
/// `rejected` and `failed` are the parts of `skipped` that were errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Failed ingress validation
    pub rejected: usize,
    /// Valid entries whose write failed
    pub failed: usize,
}

impl ReconcileReport {
    fn record(&mut self, outcome: &EntryOutcome) {
        match outcome {
            EntryOutcome::Inserted(_) => self.inserted += 1,
            EntryOutcome::Updated(_) => self.updated += 1,
            EntryOutcome::Unchanged(_) => self.skipped += 1,
        }
    }

    fn reject(&mut self) {
        self.rejected += 1;
        self.skipped += 1;
    }

    fn fail(&mut self) {
        self.failed += 1;
        self.skipped += 1;
    }
}

/// What applying one entry did
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Inserted(StockVariant),
    Updated(StockVariant),
    /// Matched, but the entry carried nothing new
    Unchanged(String),
}

/// Additive-and-fill update of `existing` from `entry`.
///
/// Fields equal to what is stored are left out, so an entry that adds
/// nothing yields a no-op update.
pub fn plan_fill(existing: &StockVariant, entry: &BatchEntry) -> FillUpdate {
    fn price(incoming: f64, current: f64) -> Option<f64> {
        (incoming > 0.0 && incoming != current).then_some(incoming)
    }
    fn text(incoming: &str, current: &str) -> Option<String> {
        let incoming = incoming.trim();
        (!incoming.is_empty() && incoming != current).then(|| incoming.to_string())
    }

    FillUpdate {
        quantity_delta: entry.quantity,
        cost_price: price(entry.cost_price, existing.cost_price),
        sale_price: price(entry.sale_price, existing.sale_price),
        name: text(&entry.name, &existing.name),
        // Brand matched case-insensitively; a case-only difference is not new data
        brand: (!entry.brand.trim().is_empty()
            && normalize_label(&entry.brand) != normalize_label(&existing.brand))
        .then(|| entry.brand.trim().to_string()),
        category: text(&entry.category, &existing.category),
        description: text(&entry.description, &existing.description),
    }
}

fn draft_from(entry: &BatchEntry) -> VariantDraft {
    VariantDraft {
        barcode: entry.barcode.clone(),
        name: entry.name.clone(),
        brand: entry.brand.clone(),
        variant_tag: entry.variant_tag.clone(),
        category: entry.category.clone(),
        description: entry.description.clone(),
        quantity: entry.quantity,
        cost_price: entry.cost_price,
        sale_price: entry.sale_price,
    }
}

/// Match and write one entry on `conn`. `pool` is the live set as of
/// the previous entry.
pub async fn apply_entry(
    conn: &mut SqliteConnection,
    pool: &[StockVariant],
    entry: &BatchEntry,
) -> ReconResult<EntryOutcome> {
    match match_variant(entry, pool, MatchPolicy::DESCRIPTIVE) {
        MatchOutcome::Matched { identity_id, tier } => {
            let existing = pool
                .iter()
                .find(|v| v.identity_id == identity_id)
                .ok_or_else(|| ReconError::MergeConflict {
                    identity_id: identity_id.clone(),
                    reason: "matched variant missing from pool".to_string(),
                })?;

            let update = plan_fill(existing, entry);
            if update.is_noop() {
                tracing::debug!(barcode = %entry.barcode, identity_id = %identity_id, "Entry adds nothing");
                return Ok(EntryOutcome::Unchanged(identity_id));
            }

            IdentityStore::apply_fill(conn, &identity_id, &update).await?;
            let refreshed = IdentityStore::load_variant(conn, &identity_id)
                .await?
                .ok_or_else(|| ReconError::MergeConflict {
                    identity_id: identity_id.clone(),
                    reason: "row vanished during update".to_string(),
                })?;

            tracing::debug!(
                barcode = %entry.barcode,
                identity_id = %identity_id,
                ?tier,
                quantity_delta = update.quantity_delta,
                "Entry updated existing variant"
            );
            Ok(EntryOutcome::Updated(refreshed))
        }
        outcome => {
            if let MatchOutcome::Ambiguous { identity_ids } = &outcome {
                tracing::info!(
                    barcode = %entry.barcode,
                    candidates = identity_ids.len(),
                    "Barcode ambiguous without brand or name match, inserting new variant"
                );
            }
            let created = IdentityStore::insert_variant(conn, &draft_from(entry)).await?;
            tracing::debug!(barcode = %entry.barcode, identity_id = %created.identity_id, "Entry inserted");
            Ok(EntryOutcome::Inserted(created))
        }
    }
}

fn absorb(pool: &mut Vec<StockVariant>, outcome: &EntryOutcome) {
    match outcome {
        EntryOutcome::Inserted(v) => pool.push(v.clone()),
        EntryOutcome::Updated(v) => {
            if let Some(slot) = pool.iter_mut().find(|p| p.identity_id == v.identity_id) {
                *slot = v.clone();
            }
        }
        EntryOutcome::Unchanged(_) => {}
    }
}

/// Batch Reconciler
pub struct Reconciler {
    store: IdentityStore,
    mode: BatchMode,
}

impl Reconciler {
    pub fn new(store: IdentityStore, mode: BatchMode) -> Self {
        Self { store, mode }
    }

    /// Reconcile a parsed batch. Returns Err only when the store is
    /// unreachable (or, in single-transaction mode, the batch commit fails).
    pub async fn reconcile(&self, batch: &[ReconResult<BatchEntry>]) -> ReconResult<ReconcileReport> {
        tracing::info!(entries = batch.len(), mode = self.mode.as_str(), "Batch reconciliation started");

        let max_wait_ms = self.store.max_lock_wait_ms().await;
        let report = match self.mode {
            BatchMode::SingleTransaction => {
                retry_on_lock("reconcile batch", max_wait_ms, || self.run_single_transaction(batch))
                    .await?
            }
            BatchMode::PerEntry => self.run_per_entry(batch, max_wait_ms).await?,
        };

        tracing::info!(
            total = report.total,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            rejected = report.rejected,
            failed = report.failed,
            "Batch reconciliation complete"
        );
        Ok(report)
    }

    /// One transaction for the batch; each entry runs inside a savepoint
    async fn run_single_transaction(
        &self,
        batch: &[ReconResult<BatchEntry>],
    ) -> ReconResult<ReconcileReport> {
        let mut report = ReconcileReport {
            total: batch.len(),
            ..Default::default()
        };

        let mut tx = self.store.begin("reconciler::batch").await?;
        let mut pool = IdentityStore::load_live_variants(&mut **tx.inner_mut()).await?;

        for (index, item) in batch.iter().enumerate() {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(index, error = %err, "Entry rejected");
                    report.reject();
                    continue;
                }
            };

            let mut savepoint = Connection::begin(&mut **tx.inner_mut()).await?;
            match apply_entry(&mut savepoint, &pool, entry).await {
                Ok(outcome) => {
                    savepoint.commit().await?;
                    absorb(&mut pool, &outcome);
                    report.record(&outcome);
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    // Lock contention abandons the whole batch transaction so
                    // the outer retry replays every entry
                    if err.is_fatal() || err.is_lock_contention() {
                        return Err(err);
                    }
                    tracing::warn!(index, barcode = %entry.barcode, error = %err, "Entry failed");
                    report.fail();
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    /// Every entry commits on its own and is retried on lock
    async fn run_per_entry(
        &self,
        batch: &[ReconResult<BatchEntry>],
        max_wait_ms: u64,
    ) -> ReconResult<ReconcileReport> {
        let mut report = ReconcileReport {
            total: batch.len(),
            ..Default::default()
        };
        let mut pool = self.store.live_variants().await?;

        for (index, item) in batch.iter().enumerate() {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(index, error = %err, "Entry rejected");
                    report.reject();
                    continue;
                }
            };

            let snapshot = &pool;
            let result = retry_on_lock("reconcile entry", max_wait_ms, || async move {
                let mut tx = self.store.begin("reconciler::entry").await?;
                let outcome = apply_entry(&mut **tx.inner_mut(), snapshot, entry).await?;
                tx.commit().await?;
                Ok::<_, ReconError>(outcome)
            })
            .await;

            match result {
                Ok(outcome) => {
                    absorb(&mut pool, &outcome);
                    report.record(&outcome);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(index, barcode = %entry.barcode, error = %err, "Entry failed");
                    report.fail();
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::parse_batch;
    use stokid_common::db::open_in_memory;

    fn entry(barcode: &str, name: &str, brand: &str, quantity: i64) -> BatchEntry {
        BatchEntry {
            barcode: barcode.into(),
            name: name.into(),
            brand: brand.into(),
            quantity,
            ..Default::default()
        }
    }

    async fn reconciler(mode: BatchMode) -> (Reconciler, IdentityStore) {
        let store = IdentityStore::new(open_in_memory().await.unwrap());
        (Reconciler::new(store.clone(), mode), store)
    }

    #[test]
    fn test_plan_fill_never_erases() {
        let existing = StockVariant {
            seq: 1,
            identity_id: "a".into(),
            barcode: "1".into(),
            name: "Tea".into(),
            brand: "Lipton".into(),
            variant_tag: String::new(),
            category: "Drinks".into(),
            description: "Black tea".into(),
            quantity_on_hand: 4,
            cost_price: 2.0,
            sale_price: 3.0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let mut incoming = entry("1", "", "LIPTON", 0);
        incoming.sale_price = 0.0;
        assert!(plan_fill(&existing, &incoming).is_noop());

        incoming.quantity = 2;
        incoming.cost_price = 2.5;
        incoming.description = "Earl grey".into();
        let update = plan_fill(&existing, &incoming);
        assert_eq!(update.quantity_delta, 2);
        assert_eq!(update.cost_price, Some(2.5));
        assert_eq!(update.sale_price, None);
        assert_eq!(update.name, None);
        assert_eq!(update.brand, None);
        assert_eq!(update.category, None);
        assert_eq!(update.description.as_deref(), Some("Earl grey"));
    }

    #[tokio::test]
    async fn test_new_entry_is_inserted() {
        let (recon, store) = reconciler(BatchMode::SingleTransaction).await;
        let batch = parse_batch(r#"[{"barcode":"Z","name":"Pad","brand":"","quantity":5,"cost_price":10}]"#).unwrap();

        let report = recon.reconcile(&batch).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.total, 1);

        let rows = store.variants_with_barcode("Z").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity_on_hand, 5);
        assert_eq!(rows[0].cost_price, 10.0);
        assert!(!rows[0].identity_id.is_empty());
    }

    #[tokio::test]
    async fn test_blank_barcode_is_rejected() {
        let (recon, store) = reconciler(BatchMode::SingleTransaction).await;
        let batch = parse_batch(r#"[{"barcode":"  ","name":"Ghost","quantity":1}]"#).unwrap();

        let report = recon.reconcile(&batch).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rejected, 1);
        assert!(store.live_variants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_does_not_duplicate_itself() {
        for mode in [BatchMode::SingleTransaction, BatchMode::PerEntry] {
            let (recon, store) = reconciler(mode).await;
            let batch = vec![
                Ok(entry("1", "Soap", "Dove", 2)),
                Ok(entry("1", "Soap", "DOVE", 3)),
                Ok(entry("1", "Soap", "Dove", 0)),
            ];

            let report = recon.reconcile(&batch).await.unwrap();
            assert_eq!((report.inserted, report.updated, report.skipped), (1, 1, 1), "{:?}", mode);

            let rows = store.live_variants().await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].quantity_on_hand, 5);
        }
    }

    #[tokio::test]
    async fn test_ambiguous_barcode_inserts_new_variant() {
        let (recon, store) = reconciler(BatchMode::SingleTransaction).await;
        recon
            .reconcile(&[Ok(entry("X", "Soap", "A", 4)), Ok(entry("X", "Soap Bar", "B", 1))])
            .await
            .unwrap();

        // Neither brand nor name matches: tier 4 is not used, so a new row appears
        let report = recon.reconcile(&[Ok(entry("X", "Soap Mini", "C", 2))]).await.unwrap();
        assert_eq!(report.inserted, 1);

        let rows = store.variants_with_barcode("X").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].quantity_on_hand, 4);
        assert_eq!(rows[1].quantity_on_hand, 1);
    }

    #[tokio::test]
    async fn test_counts_always_sum_to_total() {
        let (recon, _store) = reconciler(BatchMode::PerEntry).await;
        let batch = parse_batch(
            r#"[{"barcode":"1","name":"A","quantity":1},
                {"barcode":"","name":"B"},
                {"barcode":"1","name":"A","quantity":1},
                {"barcode":"2","quantity":-1},
                {"barcode":"1","name":"A"}]"#,
        )
        .unwrap();

        let report = recon.reconcile(&batch).await.unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.inserted + report.updated + report.skipped, report.total);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
    }
}
