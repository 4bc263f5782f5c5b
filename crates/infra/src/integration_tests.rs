//! End-to-end exercises over the in-memory store + bus.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use stocktake_audit::{AuditItemStatus, AuditStatus};
use stocktake_core::{AggregateId, ExpectedVersion, UserId, WarehouseId};
use stocktake_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use stocktake_inventory::{
    InventoryCommand, InventoryItem, InventoryItemId, ProductId, ProductRef, RegisterItem,
    StorageLocation,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, UncommittedEvent};
use crate::projections::{AuditsProjection, StockLevelsProjection};
use crate::read_model::InMemoryStore;
use crate::reconciliation::{
    AuditOrchestrator, AUDIT_AGGREGATE_TYPE, INVENTORY_AGGREGATE_TYPE,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Store = Arc<InMemoryEventStore>;
type StockProjection = Arc<StockLevelsProjection<Arc<InMemoryStore<InventoryItemId, crate::projections::StockReadModel>>>>;
type AuditProjection = Arc<AuditsProjection<Arc<InMemoryStore<stocktake_audit::AuditId, crate::projections::AuditReadModel>>>>;

struct Harness {
    store: Store,
    dispatcher: CommandDispatcher<Store, Bus>,
    orchestrator: AuditOrchestrator<Store, Bus, StockProjection>,
    stock: StockProjection,
    audits: AuditProjection,
    subscription: Subscription<EventEnvelope<JsonValue>>,
}

impl Harness {
    fn new() -> Self {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();

        let stock: StockProjection =
            Arc::new(StockLevelsProjection::new(Arc::new(InMemoryStore::new())));
        let audits: AuditProjection =
            Arc::new(AuditsProjection::new(Arc::new(InMemoryStore::new())));

        let dispatcher = CommandDispatcher::new(store.clone(), bus.clone());
        let orchestrator = AuditOrchestrator::new(store.clone(), bus.clone(), stock.clone());

        Self {
            store,
            dispatcher,
            orchestrator,
            stock,
            audits,
            subscription,
        }
    }

    /// Apply everything published so far into the projections.
    fn drain(&self) {
        while let Ok(env) = self.subscription.try_recv() {
            match env.aggregate_type() {
                AUDIT_AGGREGATE_TYPE => self.audits.apply_envelope(&env).unwrap(),
                INVENTORY_AGGREGATE_TYPE => self.stock.apply_envelope(&env).unwrap(),
                other => panic!("unexpected aggregate type '{other}'"),
            }
        }
    }

    fn register_inventory(&self, warehouse_id: WarehouseId, sku: &str, on_hand: i64) -> InventoryItemId {
        let item_id = InventoryItemId::new(AggregateId::new());
        self.dispatcher
            .dispatch::<InventoryItem>(
                item_id.0,
                INVENTORY_AGGREGATE_TYPE,
                InventoryCommand::RegisterItem(RegisterItem {
                    item_id,
                    product: ProductRef {
                        product_id: ProductId::new(),
                        sku: sku.to_string(),
                        name: format!("{sku} name"),
                    },
                    warehouse_id,
                    location: StorageLocation::bin_only(format!("BIN-{sku}")),
                    initial_on_hand: on_hand,
                    occurred_at: chrono::Utc::now(),
                }),
                |id| InventoryItem::empty(InventoryItemId::new(id)),
            )
            .unwrap();
        item_id
    }

    fn on_hand(&self, item_id: InventoryItemId) -> i64 {
        self.dispatcher
            .load::<InventoryItem>(item_id.0, |id| InventoryItem::empty(InventoryItemId::new(id)))
            .unwrap()
            .on_hand()
    }
}

#[test]
fn audit_lifecycle_reconciles_inventory_exactly_once() {
    let h = Harness::new();
    let warehouse = WarehouseId::new();
    let counter = UserId::new();

    let short_item = h.register_inventory(warehouse, "SKU-A", 10);
    let clean_item = h.register_inventory(warehouse, "SKU-B", 5);
    let untouched = h.register_inventory(warehouse, "SKU-C", 0);
    h.drain();

    // Generate: one audit item per inventory line, expected = on-hand.
    let new_audit = h.orchestrator.plan_audit(warehouse, None, counter).unwrap();
    let started = h.orchestrator.start_audit(new_audit.audit_id).unwrap();
    assert_eq!(started.items_created, 3);
    h.drain();

    let rm = h.audits.get(&new_audit.audit_id).unwrap();
    assert_eq!(rm.status, AuditStatus::InProgress);
    let item_for = |inv: InventoryItemId| {
        rm.items
            .iter()
            .find(|i| i.inventory_item_id == inv)
            .unwrap()
            .id
    };

    // Count: one short (10 → 6), one clean, one never counted.
    h.orchestrator
        .record_count(new_audit.audit_id, item_for(short_item), 6, None, counter)
        .unwrap();
    h.orchestrator
        .record_count(new_audit.audit_id, item_for(clean_item), 5, None, counter)
        .unwrap();
    h.orchestrator
        .set_item_status(
            new_audit.audit_id,
            item_for(short_item),
            AuditItemStatus::Reconciled,
            Some("accepted".to_string()),
            counter,
        )
        .unwrap();

    // Complete: exactly one correction (-4), applied once.
    let outcome = h.orchestrator.complete_audit(new_audit.audit_id).unwrap();
    assert_eq!(outcome.corrections, 1);
    assert_eq!(outcome.adjustments_applied, 1);

    assert_eq!(h.on_hand(short_item), 6);
    assert_eq!(h.on_hand(clean_item), 5);
    assert_eq!(h.on_hand(untouched), 0);

    // Re-driving the corrections (bus safety net, crash retry) is a no-op.
    h.drain();
    let rm = h.audits.get(&new_audit.audit_id).unwrap();
    assert_eq!(rm.status, AuditStatus::Completed);
    let audit = h.orchestrator.load_audit(new_audit.audit_id).unwrap();
    let corrections: Vec<_> = audit
        .items()
        .iter()
        .filter(|i| i.has_variance())
        .collect();
    assert_eq!(corrections.len(), 1);
    let reapplied = h
        .orchestrator
        .apply_corrections(
            new_audit.audit_id,
            &[stocktake_audit::StockCorrection {
                audit_item_id: corrections[0].id,
                inventory_item_id: short_item,
                delta: -4,
            }],
        )
        .unwrap();
    assert_eq!(reapplied, 0);
    assert_eq!(h.on_hand(short_item), 6);

    // A second completion attempt is rejected.
    let err = h.orchestrator.complete_audit(new_audit.audit_id).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidState(_)));
}

#[test]
fn expected_quantities_are_a_point_in_time_snapshot() {
    let h = Harness::new();
    let warehouse = WarehouseId::new();
    let user = UserId::new();

    let item = h.register_inventory(warehouse, "SKU-A", 10);
    h.drain();

    let new_audit = h.orchestrator.plan_audit(warehouse, None, user).unwrap();
    h.orchestrator.start_audit(new_audit.audit_id).unwrap();

    // A sale after the snapshot must not move the expectation.
    h.dispatcher
        .dispatch::<InventoryItem>(
            item.0,
            INVENTORY_AGGREGATE_TYPE,
            InventoryCommand::AdjustStock(stocktake_inventory::AdjustStock {
                item_id: item,
                delta: -3,
                occurred_at: chrono::Utc::now(),
            }),
            |id| InventoryItem::empty(InventoryItemId::new(id)),
        )
        .unwrap();

    let audit = h.orchestrator.load_audit(new_audit.audit_id).unwrap();
    assert_eq!(audit.items()[0].expected_quantity, 10);
    assert_eq!(h.on_hand(item), 7);
}

#[test]
fn starting_an_audit_twice_is_invalid_state() {
    let h = Harness::new();
    let warehouse = WarehouseId::new();

    h.register_inventory(warehouse, "SKU-A", 1);
    h.drain();

    let new_audit = h
        .orchestrator
        .plan_audit(warehouse, None, UserId::new())
        .unwrap();
    h.orchestrator.start_audit(new_audit.audit_id).unwrap();

    let err = h.orchestrator.start_audit(new_audit.audit_id).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidState(_)));

    let audit = h.orchestrator.load_audit(new_audit.audit_id).unwrap();
    assert_eq!(audit.items().len(), 1, "item set unchanged");
}

#[test]
fn starting_an_unknown_audit_is_not_found() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .start_audit(stocktake_audit::AuditId::new(AggregateId::new()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound));
}

#[test]
fn losing_completer_hits_the_optimistic_append_guard() {
    let h = Harness::new();
    let warehouse = WarehouseId::new();

    h.register_inventory(warehouse, "SKU-A", 2);
    h.drain();

    let new_audit = h
        .orchestrator
        .plan_audit(warehouse, None, UserId::new())
        .unwrap();
    h.orchestrator.start_audit(new_audit.audit_id).unwrap();

    // Both completers observe this version...
    let stale_version = h
        .store
        .load_stream(new_audit.audit_id.0)
        .unwrap()
        .last()
        .unwrap()
        .sequence_number;

    // ...the first one commits...
    h.orchestrator.complete_audit(new_audit.audit_id).unwrap();

    // ...and the second one's append is rejected by the store.
    let stale_event = UncommittedEvent {
        event_id: Uuid::now_v7(),
        aggregate_id: new_audit.audit_id.0,
        aggregate_type: AUDIT_AGGREGATE_TYPE.to_string(),
        event_type: "audit.completed".to_string(),
        event_version: 1,
        occurred_at: chrono::Utc::now(),
        payload: serde_json::json!({}),
    };
    let err = h
        .store
        .append(vec![stale_event], ExpectedVersion::Exact(stale_version))
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Concurrency(_)));
}

#[test]
fn projections_ignore_replayed_envelopes() {
    let h = Harness::new();
    let warehouse = WarehouseId::new();
    let item = h.register_inventory(warehouse, "SKU-A", 9);

    let env = match h.subscription.try_recv() {
        Ok(env) => env,
        Err(e) => panic!("expected a published envelope: {e:?}"),
    };

    h.stock.apply_envelope(&env).unwrap();
    h.stock.apply_envelope(&env).unwrap();

    let rm = h.stock.get(&item).unwrap();
    assert_eq!(rm.on_hand, 9);
    assert_eq!(h.stock.list_warehouse(warehouse).len(), 1);
}
