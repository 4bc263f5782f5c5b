use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use stocktake_audit::{
    Assignment, AuditEvent, AuditId, AuditItem, AuditItemId, AuditItemStatus, AuditStatus,
};
use stocktake_core::{AggregateId, UserId, WarehouseId};
use stocktake_events::EventEnvelope;

use crate::read_model::ReadModelStore;

use super::ProjectionError;

/// Queryable audit read model: header, assignments, and the full item set.
///
/// Metrics are *not* stored here — they are recomputed from `items` on every
/// read so they can never drift from the item states.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditReadModel {
    pub audit_id: AuditId,
    pub reference: String,
    pub warehouse_id: WarehouseId,
    pub status: AuditStatus,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub assignments: Vec<Assignment>,
    pub items: Vec<AuditItem>,
}

impl AuditReadModel {
    pub fn item(&self, item_id: AuditItemId) -> Option<&AuditItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Items matching the listing filters, in snapshot order.
    pub fn filtered_items(&self, filter: &AuditItemFilter) -> Vec<&AuditItem> {
        self.items
            .iter()
            .filter(|item| filter.matches(item))
            .collect()
    }
}

/// Listing filters for `GET /audits/{id}/items`.
#[derive(Debug, Clone, Default)]
pub struct AuditItemFilter {
    pub status: Option<AuditItemStatus>,
    pub zone: Option<String>,
    pub search: Option<String>,
}

impl AuditItemFilter {
    fn matches(&self, item: &AuditItem) -> bool {
        if let Some(status) = self.status {
            if item.status != status {
                return false;
            }
        }
        if let Some(zone) = &self.zone {
            if item.zone_label() != zone.as_str() {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let haystacks = [
                item.product.sku.to_lowercase(),
                item.product.name.to_lowercase(),
                item.location.bin.to_lowercase(),
            ];
            if !haystacks.iter().any(|h| h.contains(&needle)) {
                return false;
            }
        }
        true
    }
}

/// Audits projection.
///
/// Mirrors the aggregate's state transitions into a disposable read model.
#[derive(Debug)]
pub struct AuditsProjection<S>
where
    S: ReadModelStore<AuditId, AuditReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> AuditsProjection<S>
where
    S: ReadModelStore<AuditId, AuditReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, audit_id: &AuditId) -> Option<AuditReadModel> {
        self.store.get(audit_id)
    }

    pub fn list(&self) -> Vec<AuditReadModel> {
        let mut audits = self.store.list();
        // Newest first; UUIDv7 ids are time-ordered.
        audits.sort_by_key(|a| std::cmp::Reverse(*a.audit_id.0.as_uuid()));
        audits
    }

    /// Apply a published envelope into the projection.
    ///
    /// Idempotent for at-least-once delivery: replays at or below the cursor
    /// are ignored, sequence gaps are rejected.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let Ok(mut cursors) = self.cursors.write() {
            let last = *cursors.get(&aggregate_id).unwrap_or(&0);

            if seq == 0 {
                return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
            }
            if seq <= last {
                // Duplicate or replay; safe to ignore.
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
            }

            let event: AuditEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

            self.apply_event(AuditId::new(aggregate_id), &event)?;

            // Advance cursor after successful apply.
            cursors.insert(aggregate_id, seq);
        }

        Ok(())
    }

    fn apply_event(&self, audit_id: AuditId, event: &AuditEvent) -> Result<(), ProjectionError> {
        match event {
            AuditEvent::AuditPlanned(e) => {
                if e.audit_id != audit_id {
                    return Err(ProjectionError::StreamMismatch(
                        "event audit_id does not match envelope aggregate_id".to_string(),
                    ));
                }
                self.store.upsert(
                    e.audit_id,
                    AuditReadModel {
                        audit_id: e.audit_id,
                        reference: e.reference.clone(),
                        warehouse_id: e.warehouse_id,
                        status: AuditStatus::Planned,
                        notes: e.notes.clone(),
                        created_by: e.created_by,
                        start_date: Some(e.occurred_at),
                        end_date: None,
                        assignments: Vec::new(),
                        items: Vec::new(),
                    },
                );
                Ok(())
            }
            _ => self.update(audit_id, |rm| match event {
                AuditEvent::AuditPlanned(_) => {}
                AuditEvent::CounterAssigned(e) => {
                    match rm.assignments.iter_mut().find(|a| a.user_id == e.user_id) {
                        Some(a) => a.zones = e.zones.clone(),
                        None => rm.assignments.push(Assignment {
                            user_id: e.user_id,
                            zones: e.zones.clone(),
                        }),
                    }
                }
                AuditEvent::AuditStarted(e) => {
                    rm.status = AuditStatus::InProgress;
                    rm.start_date = Some(e.occurred_at);
                    rm.items = e.lines.iter().map(AuditItem::from_snapshot).collect();
                }
                AuditEvent::ItemCounted(e) => {
                    if let Some(item) = rm.items.iter_mut().find(|i| i.id == e.item_id) {
                        item.counted_quantity = Some(e.counted_quantity);
                        item.discrepancy = Some(e.discrepancy);
                        item.status = e.status;
                        if e.notes.is_some() {
                            item.notes = e.notes.clone();
                        }
                        item.counted_by = Some(e.counted_by);
                        item.counted_at = Some(e.occurred_at);
                    }
                }
                AuditEvent::ItemStatusSet(e) => {
                    if let Some(item) = rm.items.iter_mut().find(|i| i.id == e.item_id) {
                        item.status = e.status;
                        if e.notes.is_some() {
                            item.notes = e.notes.clone();
                        }
                    }
                }
                AuditEvent::ItemReopened(e) => {
                    if let Some(item) = rm.items.iter_mut().find(|i| i.id == e.item_id) {
                        item.status = AuditItemStatus::Pending;
                        item.counted_quantity = None;
                        item.discrepancy = None;
                        item.counted_by = None;
                        item.counted_at = None;
                    }
                }
                AuditEvent::AuditCompleted(e) => {
                    rm.status = AuditStatus::Completed;
                    rm.end_date = Some(e.occurred_at);
                    for item in &mut rm.items {
                        if item.status == AuditItemStatus::Discrepancy {
                            item.status = AuditItemStatus::Reconciled;
                        }
                    }
                }
                AuditEvent::AuditCancelled(_) => {
                    rm.status = AuditStatus::Cancelled;
                }
            }),
        }
    }

    fn update(
        &self,
        audit_id: AuditId,
        f: impl FnOnce(&mut AuditReadModel),
    ) -> Result<(), ProjectionError> {
        let mut rm = self.store.get(&audit_id).ok_or_else(|| {
            ProjectionError::StreamMismatch(format!("no read model for audit {audit_id}"))
        })?;
        f(&mut rm);
        self.store.upsert(audit_id, rm);
        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
