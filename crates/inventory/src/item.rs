use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{Aggregate, AggregateId, AggregateRoot, DomainError, WarehouseId};
use stocktake_events::Event;

use crate::catalog::{ProductRef, StorageLocation};

/// Inventory line identifier (one line per product per bin).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryItemId(pub AggregateId);

impl InventoryItemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InventoryItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: InventoryItem.
///
/// Holds the live on-hand quantity of one product at one storage location.
/// Audit corrections are remembered by audit id so a reconciliation retry can
/// never apply the same correction twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    id: InventoryItemId,
    product: Option<ProductRef>,
    warehouse_id: Option<WarehouseId>,
    location: Option<StorageLocation>,
    on_hand: i64,
    applied_audits: HashSet<AggregateId>,
    version: u64,
    created: bool,
}

impl InventoryItem {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InventoryItemId) -> Self {
        Self {
            id,
            product: None,
            warehouse_id: None,
            location: None,
            on_hand: 0,
            applied_audits: HashSet::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventoryItemId {
        self.id
    }

    pub fn product(&self) -> Option<&ProductRef> {
        self.product.as_ref()
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn location(&self) -> Option<&StorageLocation> {
        self.location.as_ref()
    }

    pub fn on_hand(&self) -> i64 {
        self.on_hand
    }

    /// Whether the correction of the given audit was already applied.
    pub fn correction_applied(&self, audit_id: AggregateId) -> bool {
        self.applied_audits.contains(&audit_id)
    }
}

impl AggregateRoot for InventoryItem {
    type Id = InventoryItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterItem {
    pub item_id: InventoryItemId,
    pub product: ProductRef,
    pub warehouse_id: WarehouseId,
    pub location: StorageLocation,
    pub initial_on_hand: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock (sales, receiving, shrinkage — always a delta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub item_id: InventoryItemId,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyAuditCorrection.
///
/// Same delta semantics as [`AdjustStock`], but keyed by the originating
/// audit: applying the same audit's correction twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyAuditCorrection {
    pub item_id: InventoryItemId,
    pub audit_id: AggregateId,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    RegisterItem(RegisterItem),
    AdjustStock(AdjustStock),
    ApplyAuditCorrection(ApplyAuditCorrection),
}

/// Event: ItemRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRegistered {
    pub item_id: InventoryItemId,
    pub product: ProductRef,
    pub warehouse_id: WarehouseId,
    pub location: StorageLocation,
    pub initial_on_hand: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAdjusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub item_id: InventoryItemId,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AuditCorrectionApplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCorrectionApplied {
    pub item_id: InventoryItemId,
    pub audit_id: AggregateId,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    ItemRegistered(ItemRegistered),
    StockAdjusted(StockAdjusted),
    AuditCorrectionApplied(AuditCorrectionApplied),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::ItemRegistered(_) => "inventory.item.registered",
            InventoryEvent::StockAdjusted(_) => "inventory.item.stock_adjusted",
            InventoryEvent::AuditCorrectionApplied(_) => "inventory.item.audit_correction_applied",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::ItemRegistered(e) => e.occurred_at,
            InventoryEvent::StockAdjusted(e) => e.occurred_at,
            InventoryEvent::AuditCorrectionApplied(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryItem {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::ItemRegistered(e) => {
                self.id = e.item_id;
                self.product = Some(e.product.clone());
                self.warehouse_id = Some(e.warehouse_id);
                self.location = Some(e.location.clone());
                self.on_hand = e.initial_on_hand;
                self.created = true;
            }
            InventoryEvent::StockAdjusted(e) => {
                self.on_hand += e.delta;
            }
            InventoryEvent::AuditCorrectionApplied(e) => {
                self.on_hand += e.delta;
                self.applied_audits.insert(e.audit_id);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::RegisterItem(cmd) => self.handle_register(cmd),
            InventoryCommand::AdjustStock(cmd) => self.handle_adjust(cmd),
            InventoryCommand::ApplyAuditCorrection(cmd) => self.handle_correction(cmd),
        }
    }
}

impl InventoryItem {
    fn ensure_item_id(&self, item_id: InventoryItemId) -> Result<(), DomainError> {
        if self.id != item_id {
            return Err(DomainError::invalid_state("item_id mismatch"));
        }
        Ok(())
    }

    fn ensure_delta_applicable(&self, delta: i64) -> Result<(), DomainError> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }
        if self.on_hand + delta < 0 {
            return Err(DomainError::invalid_state("stock cannot go negative"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterItem) -> Result<Vec<InventoryEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("inventory item already exists"));
        }
        if cmd.product.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if cmd.product.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.location.bin.trim().is_empty() {
            return Err(DomainError::validation("bin cannot be empty"));
        }
        if cmd.initial_on_hand < 0 {
            return Err(DomainError::validation("initial on-hand cannot be negative"));
        }

        Ok(vec![InventoryEvent::ItemRegistered(ItemRegistered {
            item_id: cmd.item_id,
            product: cmd.product.clone(),
            warehouse_id: cmd.warehouse_id,
            location: cmd.location.clone(),
            initial_on_hand: cmd.initial_on_hand,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;
        self.ensure_delta_applicable(cmd.delta)?;

        Ok(vec![InventoryEvent::StockAdjusted(StockAdjusted {
            item_id: cmd.item_id,
            delta: cmd.delta,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_correction(
        &self,
        cmd: &ApplyAuditCorrection,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;

        // Idempotency: a correction for this audit already landed.
        if self.applied_audits.contains(&cmd.audit_id) {
            return Ok(vec![]);
        }

        self.ensure_delta_applicable(cmd.delta)?;

        Ok(vec![InventoryEvent::AuditCorrectionApplied(
            AuditCorrectionApplied {
                item_id: cmd.item_id,
                audit_id: cmd.audit_id,
                delta: cmd.delta,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProductId;

    fn test_item_id() -> InventoryItemId {
        InventoryItemId::new(AggregateId::new())
    }

    fn test_product() -> ProductRef {
        ProductRef {
            product_id: ProductId::new(),
            sku: "SKU-100".to_string(),
            name: "Widget".to_string(),
        }
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn registered_item(on_hand: i64) -> InventoryItem {
        let id = test_item_id();
        let mut item = InventoryItem::empty(id);
        let events = item
            .handle(&InventoryCommand::RegisterItem(RegisterItem {
                item_id: id,
                product: test_product(),
                warehouse_id: WarehouseId::new(),
                location: StorageLocation::bin_only("B-01"),
                initial_on_hand: on_hand,
                occurred_at: test_time(),
            }))
            .unwrap();
        item.apply(&events[0]);
        item
    }

    #[test]
    fn register_emits_item_registered_and_sets_stock() {
        let item = registered_item(12);
        assert_eq!(item.on_hand(), 12);
        assert_eq!(item.version(), 1);
    }

    #[test]
    fn register_rejects_negative_initial_stock() {
        let id = test_item_id();
        let item = InventoryItem::empty(id);
        let err = item
            .handle(&InventoryCommand::RegisterItem(RegisterItem {
                item_id: id,
                product: test_product(),
                warehouse_id: WarehouseId::new(),
                location: StorageLocation::bin_only("B-01"),
                initial_on_hand: -1,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn adjust_cannot_drive_stock_negative() {
        let item = registered_item(3);
        let err = item
            .handle(&InventoryCommand::AdjustStock(AdjustStock {
                item_id: item.id_typed(),
                delta: -4,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn audit_correction_applies_once() {
        let mut item = registered_item(20);
        let audit_id = AggregateId::new();

        let cmd = InventoryCommand::ApplyAuditCorrection(ApplyAuditCorrection {
            item_id: item.id_typed(),
            audit_id,
            delta: -5,
            occurred_at: test_time(),
        });

        let events = item.handle(&cmd).unwrap();
        assert_eq!(events.len(), 1);
        item.apply(&events[0]);
        assert_eq!(item.on_hand(), 15);
        assert!(item.correction_applied(audit_id));

        // Second application of the same audit's correction is a no-op.
        let events = item.handle(&cmd).unwrap();
        assert!(events.is_empty());
        assert_eq!(item.on_hand(), 15);
    }

    #[test]
    fn corrections_from_different_audits_both_apply() {
        let mut item = registered_item(20);

        for (audit_id, delta) in [(AggregateId::new(), -5), (AggregateId::new(), 2)] {
            let events = item
                .handle(&InventoryCommand::ApplyAuditCorrection(ApplyAuditCorrection {
                    item_id: item.id_typed(),
                    audit_id,
                    delta,
                    occurred_at: test_time(),
                }))
                .unwrap();
            item.apply(&events[0]);
        }

        assert_eq!(item.on_hand(), 17);
    }
}
