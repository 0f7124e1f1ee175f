//! Integration tests for the engine passes against a file-backed store
//!
//! Covers the dedup invariants (uniqueness, conservation, referential
//! integrity, idempotence), batch additivity, and the point-of-sale
//! scenarios end to end.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use stokid_common::db::init_database;
use stokid_recon::batch::parse_batch;
use stokid_recon::deduplicator::{find_duplicate_groups, Deduplicator};
use stokid_recon::integrity::IntegrityChecker;
use stokid_recon::matcher::VariantKey;
use stokid_recon::reconciler::Reconciler;
use stokid_recon::sale_resolver::{Resolution, SaleAttempt, SaleRequest, SaleResolver, SaleState};
use stokid_recon::{IdentityStore, ReconError};
use stokid_common::config::BatchMode;
use tempfile::TempDir;

async fn file_store() -> (TempDir, IdentityStore) {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("stokid.db")).await.unwrap();
    (dir, IdentityStore::new(pool))
}

async fn seed_variant(pool: &SqlitePool, identity: &str, barcode: &str, name: &str, brand: &str, qty: i64) {
    sqlx::query(
        "INSERT INTO stock_variant (identity_id, barcode, name, brand, quantity_on_hand, cost_price, sale_price) \
         VALUES (?, ?, ?, ?, ?, 1.5, 3.0)",
    )
    .bind(identity)
    .bind(barcode)
    .bind(name)
    .bind(brand)
    .bind(qty)
    .execute(pool)
    .await
    .unwrap();
}

async fn seed_sale(pool: &SqlitePool, barcode: &str, name: &str, brand: &str, identity: &str) -> i64 {
    sqlx::query(
        "INSERT INTO sale_record (barcode, product_name, brand, identity_id, quantity, unit_price, total, timestamp) \
         VALUES (?, ?, ?, ?, 1, 3.0, 3.0, '2024-05-01T09:00:00Z')",
    )
    .bind(barcode)
    .bind(name)
    .bind(brand)
    .bind(identity)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

/// Take the write lock on a second connection and release it after `hold`
async fn hold_write_lock(pool: &SqlitePool, hold: Duration) -> tokio::task::JoinHandle<()> {
    let mut writer = pool.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *writer).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(hold).await;
        sqlx::query("COMMIT").execute(&mut *writer).await.unwrap();
    })
}

async fn quantity_of(store: &IdentityStore, identity: &str) -> i64 {
    store.find_variant(identity).await.unwrap().unwrap().quantity_on_hand
}

// ============================================================================
// Deduplicator properties
// ============================================================================

#[tokio::test]
async fn test_dedup_uniqueness_conservation_and_referential_integrity() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();

    seed_variant(&pool, "f1", "123", "Filter", "ACME", 2).await;
    seed_variant(&pool, "f2", "123", "Filter", "acme", 3).await;
    seed_variant(&pool, "f3", " 123 ", "Filter ", "Acme", 4).await;
    seed_variant(&pool, "o1", "123", "Filter", "Other", 7).await;
    seed_variant(&pool, "c1", "555", "Cup", "", 1).await;
    seed_variant(&pool, "c2", "555", "Cup", "", 0).await;
    seed_variant(&pool, "s1", "777", "Soap", "Fresh", 9).await;

    seed_sale(&pool, "123", "Filter", "acme", "f2").await;
    seed_sale(&pool, "123", "Filter", "Acme", "f3").await;
    seed_sale(&pool, "555", "Cup", "", "c2").await;
    seed_sale(&pool, "777", "Soap", "Fresh", "s1").await;

    let before = store.live_variants().await.unwrap();
    let group_totals: HashMap<VariantKey, i64> = find_duplicate_groups(&before)
        .iter()
        .map(|g| (g.key.clone(), g.total_quantity()))
        .collect();
    assert_eq!(group_totals.len(), 2);

    let report = Deduplicator::new(store.clone()).run().await.unwrap();
    assert_eq!(report.groups_found, 2);
    assert_eq!(report.groups_merged, 2);
    assert_eq!(report.groups_skipped, 0);
    assert_eq!(report.rows_merged, 3);
    assert_eq!(report.sales_repointed, 3);
    assert_eq!(report.dangling_references, 0);

    let after = store.live_variants().await.unwrap();
    assert!(find_duplicate_groups(&after).is_empty());
    assert_eq!(after.len(), 4);

    for (key, total) in &group_totals {
        let survivors: Vec<_> = after.iter().filter(|v| &VariantKey::of(*v) == key).collect();
        assert_eq!(survivors.len(), 1, "key {} must have one survivor", key);
        assert_eq!(survivors[0].quantity_on_hand, *total);
    }

    // The earliest row of each group survives
    assert_eq!(quantity_of(&store, "f1").await, 9);
    assert_eq!(quantity_of(&store, "c1").await, 1);
    assert_eq!(quantity_of(&store, "o1").await, 7);

    assert!(store.dangling_sale_references().await.unwrap().is_empty());
    let repointed: Vec<String> = sqlx::query_scalar("SELECT identity_id FROM sale_record ORDER BY sale_id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(repointed, vec!["f1", "f1", "c1", "s1"]);
}

#[tokio::test]
async fn test_dedup_second_pass_changes_nothing() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "a", "123", "Filter", "ACME", 2).await;
    seed_variant(&pool, "b", "123", "Filter", "acme", 3).await;
    seed_sale(&pool, "123", "Filter", "acme", "b").await;

    let first = Deduplicator::new(store.clone()).run().await.unwrap();
    assert_eq!(first.groups_merged, 1);
    let snapshot = store.live_variants().await.unwrap();

    let second = Deduplicator::new(store.clone()).run().await.unwrap();
    assert_eq!(second.groups_found, 0);
    assert_eq!(second.rows_merged, 0);
    assert_eq!(second.sales_repointed, 0);
    assert_eq!(store.live_variants().await.unwrap(), snapshot);
}

#[tokio::test]
async fn test_acme_scenario_merges_to_quantity_five() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "first", "123", "Filter", "ACME", 2).await;
    seed_variant(&pool, "second", "123", "Filter", "acme", 3).await;

    Deduplicator::new(store.clone()).run().await.unwrap();

    let live = store.live_variants().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].identity_id, "first");
    assert_eq!(live[0].brand, "ACME");
    assert_eq!(live[0].quantity_on_hand, 5);
}

// ============================================================================
// Batch Reconciler
// ============================================================================

#[tokio::test]
async fn test_batch_is_additive_and_never_blanks_text() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "pad", "Z", "Pad", "Soft", 3).await;
    sqlx::query("UPDATE stock_variant SET category = 'Bath', description = 'Cotton' WHERE identity_id = 'pad'")
        .execute(&pool)
        .await
        .unwrap();

    let batch = parse_batch(
        r#"[
            {"barcode": "Z", "name": "Pad", "brand": "soft", "quantity": 2, "category": "", "description": ""},
            {"barcode": "Z", "name": "Pad", "brand": "SOFT", "quantity": 0, "sale_price": 0}
        ]"#,
    )
    .unwrap();

    for mode in [BatchMode::SingleTransaction, BatchMode::PerEntry] {
        let before = store.find_variant("pad").await.unwrap().unwrap();
        let report = Reconciler::new(store.clone(), mode).reconcile(&batch).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.inserted + report.updated + report.skipped, report.total);

        let after = store.find_variant("pad").await.unwrap().unwrap();
        assert!(after.quantity_on_hand >= before.quantity_on_hand);
        assert_eq!(after.quantity_on_hand, before.quantity_on_hand + 2);
        assert_eq!(after.brand, "Soft");
        assert_eq!(after.category, "Bath");
        assert_eq!(after.description, "Cotton");
        assert_eq!(after.sale_price, 3.0);
    }
    assert_eq!(store.live_variants().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_z_entry_inserts_and_blank_barcode_is_skipped() {
    let (_dir, store) = file_store().await;

    let batch = parse_batch(
        r#"{"products": {
            "k1": {"barcode": "Z", "name": "Pad", "brand": "", "quantity": 5, "cost_price": 10},
            "k2": {"barcode": "   ", "name": "Nameless", "quantity": 4}
        }}"#,
    )
    .unwrap();

    let report = Reconciler::new(store.clone(), BatchMode::SingleTransaction)
        .reconcile(&batch)
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rejected, 1);

    let live = store.live_variants().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].barcode, "Z");
    assert_eq!(live[0].quantity_on_hand, 5);
    assert_eq!(live[0].cost_price, 10.0);
    assert!(stokid_common::identity::is_present(&live[0].identity_id));
}

#[tokio::test]
async fn test_reconcile_then_dedup_leaves_clean_store() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "a", "123", "Filter", "ACME", 1).await;
    seed_variant(&pool, "b", "123", "Filter", "acme", 1).await;

    let batch = parse_batch(r#"[{"barcode": "123", "name": "Filter", "brand": "Acme", "quantity": "2"}]"#).unwrap();
    let report = Reconciler::new(store.clone(), BatchMode::PerEntry)
        .reconcile(&batch)
        .await
        .unwrap();
    // Both existing rows match equally well, so the entry becomes a new row
    assert_eq!(report.inserted, 1);
    assert_eq!(report.updated, 0);

    Deduplicator::new(store.clone()).run().await.unwrap();
    let check = IntegrityChecker::new(store.clone()).run().await.unwrap();
    assert!(check.is_clean());
    assert_eq!(quantity_of(&store, "a").await, 4);
}

#[tokio::test]
async fn test_batch_waits_out_a_competing_writer_in_both_modes() {
    let (_dir, store) = file_store().await;
    let batch = parse_batch(r#"[{"barcode": "Z", "name": "Pad", "quantity": 5}]"#).unwrap();

    for mode in [BatchMode::SingleTransaction, BatchMode::PerEntry] {
        let release = hold_write_lock(store.pool(), Duration::from_millis(800)).await;
        let report = Reconciler::new(store.clone(), mode).reconcile(&batch).await.unwrap();
        release.await.unwrap();

        assert_eq!(report.failed, 0, "{:?} lost the entry to lock contention", mode);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.inserted + report.updated, 1);
    }

    let live = store.live_variants().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].quantity_on_hand, 10);
}

#[tokio::test]
async fn test_closed_store_aborts_passes() {
    let (_dir, store) = file_store().await;
    seed_variant(store.pool(), "a", "123", "Filter", "ACME", 2).await;
    seed_variant(store.pool(), "b", "123", "Filter", "acme", 3).await;
    let batch = parse_batch(r#"[{"barcode": "Z", "name": "Pad", "quantity": 5}]"#).unwrap();

    store.pool().close().await;

    let err = Deduplicator::new(store.clone()).run().await.unwrap_err();
    assert!(err.is_fatal(), "dedup returned {}", err);

    for mode in [BatchMode::SingleTransaction, BatchMode::PerEntry] {
        let err = Reconciler::new(store.clone(), mode).reconcile(&batch).await.unwrap_err();
        assert!(err.is_fatal(), "{:?} returned {}", mode, err);
    }

    let err = SaleResolver::new(store.clone()).backfill_all().await.unwrap_err();
    assert!(err.is_fatal());
}

// ============================================================================
// Sale Resolver
// ============================================================================

#[tokio::test]
async fn test_ambiguous_barcode_selection_scenario() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "xa", "X", "Soap", "A", 4).await;
    seed_variant(&pool, "xb", "X", "Soap", "B", 1).await;
    let resolver = SaleResolver::new(store.clone());

    match resolver.resolve("X").await.unwrap() {
        Resolution::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
        other => panic!("expected ambiguity, got {:?}", other),
    }

    let attempt = SaleAttempt::scan("X").lookup(&resolver).await.unwrap().proceed().unwrap();
    assert!(matches!(attempt.state(), SaleState::AwaitingSelection { .. }));
    let attempt = attempt.select(&resolver, "xb").await.unwrap();
    let chosen = attempt.resolved().unwrap().clone();
    assert_eq!(chosen.brand, "B");

    let sale = resolver.complete_sale(&chosen, &SaleRequest::new(1, 3.0)).await.unwrap();
    assert_eq!(sale.identity_id, "xb");
    assert_eq!(sale.brand, "B");

    assert_eq!(quantity_of(&store, "xa").await, 4);
    assert_eq!(quantity_of(&store, "xb").await, 0);

    // Only brand A is left in stock
    match resolver.resolve("X").await.unwrap() {
        Resolution::Resolved(v) => assert_eq!(v.identity_id, "xa"),
        other => panic!("expected single candidate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sale_then_reversal_restores_stock() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "cup", "555", "Cup", "", 3).await;
    let resolver = SaleResolver::new(store.clone());

    let variant = resolver.resolve("555").await.unwrap().into_single().unwrap();
    let sale = resolver.complete_sale(&variant, &SaleRequest::new(3, 2.5)).await.unwrap();
    assert_eq!(sale.total, 7.5);
    assert_eq!(quantity_of(&store, "cup").await, 0);

    let err = resolver.resolve("555").await.unwrap_err();
    assert!(matches!(err, ReconError::NoStockAvailable { .. }));

    let reversal = resolver.reverse_sale(sale.sale_id).await.unwrap();
    assert_eq!(reversal.identity_id, "cup");
    assert!(!reversal.recreated);
    assert_eq!(quantity_of(&store, "cup").await, 3);
    assert!(store.find_sale(sale.sale_id).await.unwrap().is_none());
    assert_eq!(store.live_variants().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_legacy_sales_backfill_after_dedup() {
    let (_dir, store) = file_store().await;
    let pool = store.pool().clone();
    seed_variant(&pool, "a", "123", "Filter", "ACME", 2).await;
    seed_variant(&pool, "b", "123", "Filter", "acme", 3).await;
    seed_variant(&pool, "o", "123", "Filter", "Other", 1).await;
    let acme_sale = seed_sale(&pool, "123", "Filter", "Acme", "").await;
    let vague_sale = seed_sale(&pool, "123", "Strainer", "", "").await;

    Deduplicator::new(store.clone()).run().await.unwrap();
    let report = SaleResolver::new(store.clone()).backfill_all().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.unresolved, 1);

    assert_eq!(store.find_sale(acme_sale).await.unwrap().unwrap().identity_id, "a");
    assert_eq!(store.find_sale(vague_sale).await.unwrap().unwrap().identity_id, "");
}

#[tokio::test]
async fn test_concurrent_sales_never_oversell() {
    let (_dir, store) = file_store().await;
    seed_variant(store.pool(), "last", "999", "Lamp", "", 1).await;
    let variant = SaleResolver::new(store.clone())
        .resolve("999")
        .await
        .unwrap()
        .into_single()
        .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..2 {
        let resolver = SaleResolver::new(store.clone());
        let variant = variant.clone();
        tasks.spawn(async move { resolver.complete_sale(&variant, &SaleRequest::new(1, 9.0)).await });
    }

    let mut sold = 0;
    let mut refused = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(_) => sold += 1,
            Err(ReconError::NoStockAvailable { .. }) => refused += 1,
            Err(other) => panic!("unexpected error {}", other),
        }
    }
    assert_eq!((sold, refused), (1, 1));
    assert_eq!(quantity_of(&store, "last").await, 0);
}
