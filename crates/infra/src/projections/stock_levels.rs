use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use stocktake_core::{AggregateId, WarehouseId};
use stocktake_events::EventEnvelope;
use stocktake_inventory::{InventoryEvent, InventoryItemId, ProductRef, StorageLocation};

use crate::read_model::ReadModelStore;

use super::ProjectionError;

/// Queryable stock read model: current on-hand per inventory line.
///
/// This is the view the audit generator snapshots from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReadModel {
    pub item_id: InventoryItemId,
    pub product: ProductRef,
    pub warehouse_id: WarehouseId,
    pub location: StorageLocation,
    pub on_hand: i64,
}

/// Stock levels projection.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: ReadModelStore<InventoryItemId, StockReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: ReadModelStore<InventoryItemId, StockReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, item_id: &InventoryItemId) -> Option<StockReadModel> {
        self.store.get(item_id)
    }

    pub fn list(&self) -> Vec<StockReadModel> {
        self.store.list()
    }

    /// All tracked lines of one warehouse.
    pub fn list_warehouse(&self, warehouse_id: WarehouseId) -> Vec<StockReadModel> {
        let mut lines: Vec<StockReadModel> = self
            .store
            .list()
            .into_iter()
            .filter(|rm| rm.warehouse_id == warehouse_id)
            .collect();
        // Deterministic order for snapshot generation and listings.
        lines.sort_by_key(|rm| *rm.item_id.0.as_uuid());
        lines
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

            let event: InventoryEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

            let item_id = match &event {
                InventoryEvent::ItemRegistered(e) => e.item_id,
                InventoryEvent::StockAdjusted(e) => e.item_id,
                InventoryEvent::AuditCorrectionApplied(e) => e.item_id,
            };
            if item_id.0 != aggregate_id {
                return Err(ProjectionError::StreamMismatch(
                    "event item_id does not match envelope aggregate_id".to_string(),
                ));
            }

            match event {
                InventoryEvent::ItemRegistered(e) => {
                    self.store.upsert(
                        e.item_id,
                        StockReadModel {
                            item_id: e.item_id,
                            product: e.product,
                            warehouse_id: e.warehouse_id,
                            location: e.location,
                            on_hand: e.initial_on_hand,
                        },
                    );
                }
                InventoryEvent::StockAdjusted(e) => {
                    if let Some(mut rm) = self.store.get(&e.item_id) {
                        rm.on_hand += e.delta;
                        self.store.upsert(e.item_id, rm);
                    }
                }
                InventoryEvent::AuditCorrectionApplied(e) => {
                    if let Some(mut rm) = self.store.get(&e.item_id) {
                        rm.on_hand += e.delta;
                        self.store.upsert(e.item_id, rm);
                    }
                }
            }

            // Advance cursor after successful apply.
            cursors.insert(aggregate_id, seq);
        }

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

        // Deterministic replay order: aggregate, then sequence.
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
