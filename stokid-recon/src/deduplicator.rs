//! Duplicate stock variant merging
//!
//! Groups live variants by normalized key `(barcode, name, lower(brand))`
//! and collapses every group of two or more into its canonical row:
//! 1. Canonical = lowest `seq`, ties broken by lowest identity_id
//! 2. Canonical quantity = sum over the group
//! 3. Sales of every other member are re-pointed to the canonical identity
//! 4. Other members are deleted
//!
//! Each group merges in its own transaction, re-reading every member
//! first. A group that changed since detection is skipped and picked up
//! by the next pass. Running the pass again with no new duplicates
//! changes nothing.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use stokid_common::db::StockVariant;

use crate::error::{ReconError, ReconResult};
use crate::matcher::VariantKey;
use crate::store::IdentityStore;
use crate::utils::retry_on_lock;

/// Summary of one deduplication pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub groups_found: usize,
    pub groups_merged: usize,
    pub groups_skipped: usize,
    /// Non-canonical rows deleted
    pub rows_merged: usize,
    pub sales_repointed: u64,
    /// Sales whose identity resolves to no variant after the pass
    pub dangling_references: usize,
}

/// Live variants sharing one normalized key, canonical member first
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub key: VariantKey,
    pub members: Vec<StockVariant>,
}

impl DuplicateGroup {
    pub fn canonical(&self) -> &StockVariant {
        &self.members[0]
    }

    pub fn losers(&self) -> &[StockVariant] {
        &self.members[1..]
    }

    pub fn total_quantity(&self) -> i64 {
        self.members.iter().map(|m| m.quantity_on_hand).sum()
    }
}

/// Canonical ordering: earliest-created first, then lowest identity
pub fn canonical_order(a: &StockVariant, b: &StockVariant) -> Ordering {
    a.seq.cmp(&b.seq).then_with(|| a.identity_id.cmp(&b.identity_id))
}

/// Every group of two or more variants with the same normalized key,
/// ordered by key
pub fn find_duplicate_groups(variants: &[StockVariant]) -> Vec<DuplicateGroup> {
    let mut by_key: BTreeMap<VariantKey, Vec<StockVariant>> = BTreeMap::new();
    for variant in variants {
        by_key.entry(VariantKey::of(variant)).or_default().push(variant.clone());
    }

    by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, mut members)| {
            members.sort_by(canonical_order);
            DuplicateGroup { key, members }
        })
        .collect()
}

/// Changes made by one committed group merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub rows_merged: usize,
    pub sales_repointed: u64,
    pub merged_quantity: i64,
}

/// Deduplicator
pub struct Deduplicator {
    store: IdentityStore,
}

impl Deduplicator {
    pub fn new(store: IdentityStore) -> Self {
        Self { store }
    }

    /// Run one full pass.
    ///
    /// Returns Err only when the store is unreachable; per-group failures
    /// are counted in `groups_skipped`.
    pub async fn run(&self) -> ReconResult<DedupReport> {
        let variants = self.store.live_variants().await?;
        let groups = find_duplicate_groups(&variants);

        let mut report = DedupReport {
            groups_found: groups.len(),
            ..Default::default()
        };

        tracing::info!(
            live_variants = variants.len(),
            groups = groups.len(),
            "Deduplication pass started"
        );

        let max_wait_ms = self.store.max_lock_wait_ms().await;

        for group in &groups {
            let result = retry_on_lock("merge duplicate group", max_wait_ms, || {
                self.merge_group(group)
            })
            .await;

            match result {
                Ok(outcome) => {
                    report.groups_merged += 1;
                    report.rows_merged += outcome.rows_merged;
                    report.sales_repointed += outcome.sales_repointed;
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(key = %group.key, error = %err, "Store unavailable, aborting pass");
                    return Err(err);
                }
                Err(err) => {
                    report.groups_skipped += 1;
                    tracing::warn!(key = %group.key, error = %err, "Duplicate group skipped");
                }
            }
        }

        let dangling = self.store.dangling_sale_references().await?;
        for (sale_id, identity_id) in &dangling {
            let violation = ReconError::Referential {
                sale_id: *sale_id,
                identity_id: identity_id.clone(),
            };
            tracing::error!(sale_id, identity_id = %identity_id, "{}", violation);
        }
        report.dangling_references = dangling.len();

        tracing::info!(
            groups_found = report.groups_found,
            groups_merged = report.groups_merged,
            groups_skipped = report.groups_skipped,
            rows_merged = report.rows_merged,
            sales_repointed = report.sales_repointed,
            dangling_references = report.dangling_references,
            "Deduplication pass complete"
        );

        Ok(report)
    }

    /// Merge one group in a single transaction.
    ///
    /// Every member is re-read under the transaction; a member that
    /// vanished or no longer shares the key aborts this group with
    /// `MergeConflict` and nothing is written.
    pub async fn merge_group(&self, group: &DuplicateGroup) -> ReconResult<MergeOutcome> {
        let canonical_id = group.canonical().identity_id.clone();
        let mut tx = self.store.begin("deduplicator::merge_group").await?;

        let mut merged_quantity = 0i64;
        for member in &group.members {
            let current = IdentityStore::load_variant(&mut **tx.inner_mut(), &member.identity_id)
                .await?
                .ok_or_else(|| ReconError::MergeConflict {
                    identity_id: member.identity_id.clone(),
                    reason: "row no longer exists".to_string(),
                })?;

            if VariantKey::of(&current) != group.key {
                return Err(ReconError::MergeConflict {
                    identity_id: member.identity_id.clone(),
                    reason: format!("key changed to {}", VariantKey::of(&current)),
                });
            }
            merged_quantity += current.quantity_on_hand;
        }

        IdentityStore::set_quantity(&mut **tx.inner_mut(), &canonical_id, merged_quantity).await?;

        let mut sales_repointed = 0u64;
        for loser in group.losers() {
            sales_repointed +=
                IdentityStore::repoint_sales(&mut **tx.inner_mut(), &loser.identity_id, &canonical_id)
                    .await?;

            let deleted = IdentityStore::delete_variant(&mut **tx.inner_mut(), &loser.identity_id).await?;
            if deleted != 1 {
                return Err(ReconError::MergeConflict {
                    identity_id: loser.identity_id.clone(),
                    reason: "delete affected no row".to_string(),
                });
            }
        }

        tx.commit().await?;

        tracing::info!(
            key = %group.key,
            canonical = %canonical_id,
            merged = group.losers().len(),
            quantity = merged_quantity,
            sales_repointed,
            "Duplicate group merged"
        );

        Ok(MergeOutcome {
            rows_merged: group.losers().len(),
            sales_repointed,
            merged_quantity,
        })
    }
}
