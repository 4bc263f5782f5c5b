//! Derived audit metrics.
//!
//! Pure functions over an audit's item set, recomputed on every read and
//! never stored, so they can't drift from the underlying item states.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::audit::{AuditItem, AuditItemStatus};

/// Progress and accuracy figures for a set of audit items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditProgress {
    pub total_items: usize,
    /// Items with any recorded count, open discrepancies included.
    pub counted_items: usize,
    /// Items counted clean or reconciled (open discrepancies excluded).
    pub perfectly_counted_items: usize,
    /// Open discrepancies, plus any item whose variance never reached zero —
    /// reconciled-with-variance lines count here too.
    pub discrepancy_items: usize,
    /// Rounded share of perfectly counted items; 0 for an empty audit.
    pub progress_percent: u8,
    /// 100 × (counted − discrepancies) / counted; `None` until something has
    /// been counted (rendered as JSON null / "N/A").
    pub accuracy_rate: Option<f64>,
}

/// Per-zone slice of the same figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneProgress {
    pub zone: String,
    #[serde(flatten)]
    pub progress: AuditProgress,
}

fn is_counted(status: AuditItemStatus) -> bool {
    matches!(
        status,
        AuditItemStatus::Counted | AuditItemStatus::Discrepancy | AuditItemStatus::Reconciled
    )
}

fn is_perfectly_counted(status: AuditItemStatus) -> bool {
    matches!(status, AuditItemStatus::Counted | AuditItemStatus::Reconciled)
}

fn is_discrepancy(item: &AuditItem) -> bool {
    item.status == AuditItemStatus::Discrepancy || item.has_variance()
}

/// Compute progress figures for the given items.
pub fn progress<'a, I>(items: I) -> AuditProgress
where
    I: IntoIterator<Item = &'a AuditItem>,
{
    let mut total_items = 0usize;
    let mut counted_items = 0usize;
    let mut perfectly_counted_items = 0usize;
    let mut discrepancy_items = 0usize;

    for item in items {
        total_items += 1;
        if is_counted(item.status) {
            counted_items += 1;
        }
        if is_perfectly_counted(item.status) {
            perfectly_counted_items += 1;
        }
        if is_discrepancy(item) {
            discrepancy_items += 1;
        }
    }

    let progress_percent = if total_items == 0 {
        0
    } else {
        (100.0 * perfectly_counted_items as f64 / total_items as f64).round() as u8
    };

    let accuracy_rate = if counted_items == 0 {
        None
    } else {
        Some(100.0 * (counted_items - discrepancy_items) as f64 / counted_items as f64)
    };

    AuditProgress {
        total_items,
        counted_items,
        perfectly_counted_items,
        discrepancy_items,
        progress_percent,
        accuracy_rate,
    }
}

/// Group items by the zone of their storage location and compute per-zone
/// figures. Items with an incomplete location chain group under "Unassigned".
pub fn zone_breakdown<'a, I>(items: I) -> Vec<ZoneProgress>
where
    I: IntoIterator<Item = &'a AuditItem>,
{
    let mut by_zone: BTreeMap<&str, Vec<&AuditItem>> = BTreeMap::new();
    for item in items {
        by_zone.entry(item.zone_label()).or_default().push(item);
    }

    by_zone
        .into_iter()
        .map(|(zone, items)| ZoneProgress {
            zone: zone.to_string(),
            progress: progress(items.into_iter()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stocktake_core::{AggregateId, UserId};
    use stocktake_inventory::{InventoryItemId, ProductId, ProductRef, StorageLocation};

    use crate::audit::AuditItemId;

    fn item(status: AuditItemStatus, discrepancy: Option<i64>, zone: Option<&str>) -> AuditItem {
        AuditItem {
            id: AuditItemId::new(AggregateId::new()),
            inventory_item_id: InventoryItemId::new(AggregateId::new()),
            product: ProductRef {
                product_id: ProductId::new(),
                sku: "SKU-1".to_string(),
                name: "Widget".to_string(),
            },
            location: StorageLocation {
                bin: "B-01".to_string(),
                shelf: None,
                aisle: None,
                zone: zone.map(str::to_string),
            },
            expected_quantity: 10,
            counted_quantity: discrepancy.map(|d| 10 + d),
            discrepancy,
            status,
            notes: None,
            counted_by: discrepancy.map(|_| UserId::new()),
            counted_at: discrepancy.map(|_| Utc::now()),
        }
    }

    #[test]
    fn empty_audit_has_zero_progress_and_no_accuracy() {
        let p = progress([].into_iter());
        assert_eq!(p.total_items, 0);
        assert_eq!(p.progress_percent, 0);
        assert_eq!(p.accuracy_rate, None);
    }

    #[test]
    fn pending_items_have_no_accuracy_rate() {
        let items = vec![item(AuditItemStatus::Pending, None, None)];
        let p = progress(items.iter());
        assert_eq!(p.counted_items, 0);
        assert_eq!(p.accuracy_rate, None);
    }

    #[test]
    fn open_discrepancies_count_as_counted_but_not_perfect() {
        let items = vec![
            item(AuditItemStatus::Counted, Some(0), None),
            item(AuditItemStatus::Discrepancy, Some(-2), None),
            item(AuditItemStatus::Pending, None, None),
            item(AuditItemStatus::Pending, None, None),
        ];
        let p = progress(items.iter());

        assert_eq!(p.total_items, 4);
        assert_eq!(p.counted_items, 2);
        assert_eq!(p.perfectly_counted_items, 1);
        assert_eq!(p.discrepancy_items, 1);
        assert_eq!(p.progress_percent, 25);
        assert_eq!(p.accuracy_rate, Some(50.0));
    }

    #[test]
    fn reconciled_items_with_variance_still_count_as_discrepancies() {
        // The intentional superset: a reconciled line whose variance never
        // reached zero is perfect for progress but discrepant for accuracy.
        let items = vec![
            item(AuditItemStatus::Reconciled, Some(-5), None),
            item(AuditItemStatus::Counted, Some(0), None),
        ];
        let p = progress(items.iter());

        assert_eq!(p.perfectly_counted_items, 2);
        assert_eq!(p.progress_percent, 100);
        assert_eq!(p.discrepancy_items, 1);
        assert_eq!(p.accuracy_rate, Some(50.0));
    }

    #[test]
    fn progress_percent_rounds_to_nearest() {
        let items = vec![
            item(AuditItemStatus::Counted, Some(0), None),
            item(AuditItemStatus::Pending, None, None),
            item(AuditItemStatus::Pending, None, None),
        ];
        // 1/3 = 33.33… → 33
        assert_eq!(progress(items.iter()).progress_percent, 33);

        let items = vec![
            item(AuditItemStatus::Counted, Some(0), None),
            item(AuditItemStatus::Counted, Some(0), None),
            item(AuditItemStatus::Pending, None, None),
        ];
        // 2/3 = 66.66… → 67
        assert_eq!(progress(items.iter()).progress_percent, 67);
    }

    #[test]
    fn progress_never_decreases_as_items_are_counted() {
        let mut items = vec![
            item(AuditItemStatus::Pending, None, None),
            item(AuditItemStatus::Pending, None, None),
            item(AuditItemStatus::Pending, None, None),
        ];
        let mut last = progress(items.iter()).progress_percent;

        for i in 0..items.len() {
            items[i] = item(AuditItemStatus::Counted, Some(0), None);
            let now = progress(items.iter()).progress_percent;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn zone_breakdown_groups_incomplete_chains_under_unassigned() {
        let items = vec![
            item(AuditItemStatus::Counted, Some(0), Some("A")),
            item(AuditItemStatus::Pending, None, Some("A")),
            item(AuditItemStatus::Discrepancy, Some(3), None),
        ];
        let zones = zone_breakdown(items.iter());

        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].zone, "A");
        assert_eq!(zones[0].progress.total_items, 2);
        assert_eq!(zones[0].progress.progress_percent, 50);
        assert_eq!(zones[1].zone, "Unassigned");
        assert_eq!(zones[1].progress.discrepancy_items, 1);
    }
}
