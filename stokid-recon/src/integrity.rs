//! Read-only store integrity check
//!
//! Reports the conditions the other passes exist to fix. Nothing is written.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::deduplicator::find_duplicate_groups;
use crate::error::{ReconError, ReconResult};
use crate::matcher::{normalize_barcode, VariantKey};
use crate::store::IdentityStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub seq: i64,
    pub identity_id: String,
    pub quantity_on_hand: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroupReport {
    pub key: VariantKey,
    pub members: Vec<GroupMember>,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub sale_id: i64,
    pub identity_id: String,
}

/// Barcode carried by several live variants (legitimate, informational)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedBarcode {
    pub barcode: String,
    pub identity_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub live_variants: usize,
    pub duplicate_groups: Vec<DuplicateGroupReport>,
    /// `seq` of rows with a blank identity
    pub missing_identities: Vec<i64>,
    /// Identities carried by more than one row
    pub shared_identities: Vec<String>,
    pub dangling_references: Vec<DanglingReference>,
    pub shared_barcodes: Vec<SharedBarcode>,
}

impl IntegrityReport {
    /// True when no invariant is violated. Shared barcodes don't count.
    pub fn is_clean(&self) -> bool {
        self.duplicate_groups.is_empty()
            && self.missing_identities.is_empty()
            && self.shared_identities.is_empty()
            && self.dangling_references.is_empty()
    }
}

pub struct IntegrityChecker {
    store: IdentityStore,
}

impl IntegrityChecker {
    pub fn new(store: IdentityStore) -> Self {
        Self { store }
    }

    pub async fn run(&self) -> ReconResult<IntegrityReport> {
        let variants = self.store.live_variants().await?;

        let duplicate_groups = find_duplicate_groups(&variants)
            .into_iter()
            .map(|group| DuplicateGroupReport {
                total_quantity: group.total_quantity(),
                members: group
                    .members
                    .iter()
                    .map(|m| GroupMember {
                        seq: m.seq,
                        identity_id: m.identity_id.clone(),
                        quantity_on_hand: m.quantity_on_hand,
                    })
                    .collect(),
                key: group.key,
            })
            .collect();

        let missing_identities = variants
            .iter()
            .filter(|v| !stokid_common::identity::is_present(&v.identity_id))
            .map(|v| v.seq)
            .collect();

        let mut by_identity: BTreeMap<&str, usize> = BTreeMap::new();
        let mut by_barcode: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for v in &variants {
            if stokid_common::identity::is_present(&v.identity_id) {
                *by_identity.entry(v.identity_id.as_str()).or_default() += 1;
            }
            by_barcode
                .entry(normalize_barcode(&v.barcode))
                .or_default()
                .push(v.identity_id.clone());
        }

        let shared_identities = by_identity
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id.to_string())
            .collect();

        let shared_barcodes = by_barcode
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(barcode, identity_ids)| SharedBarcode {
                barcode: barcode.to_string(),
                identity_ids,
            })
            .collect();

        let dangling_references: Vec<DanglingReference> = self
            .store
            .dangling_sale_references()
            .await?
            .into_iter()
            .map(|(sale_id, identity_id)| DanglingReference { sale_id, identity_id })
            .collect();
        for dangling in &dangling_references {
            let violation = ReconError::Referential {
                sale_id: dangling.sale_id,
                identity_id: dangling.identity_id.clone(),
            };
            tracing::error!(sale_id = dangling.sale_id, "{}", violation);
        }

        let report = IntegrityReport {
            live_variants: variants.len(),
            duplicate_groups,
            missing_identities,
            shared_identities,
            dangling_references,
            shared_barcodes,
        };

        tracing::info!(
            live_variants = report.live_variants,
            duplicate_groups = report.duplicate_groups.len(),
            missing_identities = report.missing_identities.len(),
            shared_identities = report.shared_identities.len(),
            dangling_references = report.dangling_references.len(),
            shared_barcodes = report.shared_barcodes.len(),
            clean = report.is_clean(),
            "Integrity check complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stokid_common::db::open_in_memory;

    #[tokio::test]
    async fn test_empty_store_is_clean() {
        let store = IdentityStore::new(open_in_memory().await.unwrap());
        let report = IntegrityChecker::new(store).run().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.live_variants, 0);
    }

    #[tokio::test]
    async fn test_reports_every_problem_kind() {
        let pool = open_in_memory().await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO stock_variant (identity_id, barcode, name, brand, quantity_on_hand) VALUES
                ('a', '123', 'Filter', 'ACME', 2),
                ('b', '123', 'Filter', 'acme', 3),
                ('c', '123', 'Filter', 'Other', 1),
                ('d', '9', 'Cup', '', 1)
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO sale_record (barcode, identity_id, timestamp) VALUES ('123', 'zzz', '2024-05-01T09:00:00Z')")
            .execute(&pool)
            .await
            .unwrap();

        let report = IntegrityChecker::new(IdentityStore::new(pool)).run().await.unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.duplicate_groups.len(), 1);
        assert_eq!(report.duplicate_groups[0].total_quantity, 5);
        assert_eq!(report.duplicate_groups[0].members[0].identity_id, "a");
        assert_eq!(report.dangling_references, vec![DanglingReference { sale_id: 1, identity_id: "zzz".into() }]);
        assert_eq!(report.shared_barcodes.len(), 1);
        assert_eq!(report.shared_barcodes[0].identity_ids.len(), 3);
        assert!(report.missing_identities.is_empty());
        assert!(report.shared_identities.is_empty());
    }
}
