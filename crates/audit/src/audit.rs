use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, Entity, UserId, WarehouseId,
};
use stocktake_events::Event;
use stocktake_inventory::{InventoryItemId, ProductRef, StorageLocation};

/// Audit identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(pub AggregateId);

impl AuditId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AuditId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Audit line item identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditItemId(pub AggregateId);

impl AuditItemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AuditItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Audit lifecycle.
///
/// Planned → InProgress → Completed; Cancelled is reachable from Planned and
/// InProgress only. Completed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

/// Line item lifecycle.
///
/// A one-way ratchet: once a count exists the item never returns to Pending
/// through the status write path (reopening is a separate privileged
/// operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditItemStatus {
    Pending,
    Counted,
    Discrepancy,
    Reconciled,
}

/// A counter's zone-of-responsibility within one audit.
///
/// Authoritative: a user holding an assignment may only count items whose
/// zone is in their set. Users without an assignment are unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub user_id: UserId,
    pub zones: Vec<String>,
}

/// One inventory line captured at audit start.
///
/// `expected_quantity` is the on-hand value at snapshot time and never
/// changes afterwards, whatever live inventory does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLine {
    pub audit_item_id: AuditItemId,
    pub inventory_item_id: InventoryItemId,
    pub product: ProductRef,
    pub location: StorageLocation,
    pub expected_quantity: i64,
}

/// One product/location line within an audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditItem {
    pub id: AuditItemId,
    pub inventory_item_id: InventoryItemId,
    pub product: ProductRef,
    pub location: StorageLocation,
    pub expected_quantity: i64,
    pub counted_quantity: Option<i64>,
    pub discrepancy: Option<i64>,
    pub status: AuditItemStatus,
    pub notes: Option<String>,
    pub counted_by: Option<UserId>,
    pub counted_at: Option<DateTime<Utc>>,
}

impl AuditItem {
    pub fn from_snapshot(line: &SnapshotLine) -> Self {
        Self {
            id: line.audit_item_id,
            inventory_item_id: line.inventory_item_id,
            product: line.product.clone(),
            location: line.location.clone(),
            expected_quantity: line.expected_quantity,
            counted_quantity: None,
            discrepancy: None,
            status: AuditItemStatus::Pending,
            notes: None,
            counted_by: None,
            counted_at: None,
        }
    }

    pub fn zone_label(&self) -> &str {
        self.location.zone_label()
    }

    /// A recorded count exists and differs from the expectation.
    pub fn has_variance(&self) -> bool {
        self.discrepancy.is_some_and(|d| d != 0)
    }

    /// Locked items reject casual writes; only the reopen path clears them.
    pub fn is_locked(&self) -> bool {
        matches!(
            self.status,
            AuditItemStatus::Counted | AuditItemStatus::Reconciled
        )
    }
}

impl Entity for AuditItem {
    type Id = AuditItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// An accepted variance to be written back into live inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCorrection {
    pub audit_item_id: AuditItemId,
    pub inventory_item_id: InventoryItemId,
    pub delta: i64,
}

/// Aggregate root: Audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audit {
    id: AuditId,
    reference: String,
    warehouse_id: Option<WarehouseId>,
    status: AuditStatus,
    notes: Option<String>,
    created_by: Option<UserId>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    assignments: Vec<Assignment>,
    items: Vec<AuditItem>,
    version: u64,
    created: bool,
}

impl Audit {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: AuditId) -> Self {
        Self {
            id,
            reference: String::new(),
            warehouse_id: None,
            status: AuditStatus::Planned,
            notes: None,
            created_by: None,
            start_date: None,
            end_date: None,
            assignments: Vec::new(),
            items: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AuditId {
        self.id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn status(&self) -> AuditStatus {
        self.status
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn items(&self) -> &[AuditItem] {
        &self.items
    }

    pub fn item(&self, item_id: AuditItemId) -> Option<&AuditItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn exists(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Audit {
    type Id = AuditId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlanAudit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAudit {
    pub audit_id: AuditId,
    pub reference: String,
    pub warehouse_id: WarehouseId,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignCounter (allowed while Planned or InProgress).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignCounter {
    pub audit_id: AuditId,
    pub user_id: UserId,
    pub zones: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartAudit.
///
/// Carries the full snapshot so the item materialization and the
/// Planned → InProgress transition commit as one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAudit {
    pub audit_id: AuditId,
    pub lines: Vec<SnapshotLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordCount (direct physical count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCount {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub counted_quantity: i64,
    pub notes: Option<String>,
    pub counted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReportMissing (discrepancy report by missing quantity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMissing {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub missing_quantity: i64,
    pub notes: Option<String>,
    pub counted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetItemStatus (operator acceptance of a variance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetItemStatus {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub status: AuditItemStatus,
    pub notes: Option<String>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReopenItem (privileged recount path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReopenItem {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteAudit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteAudit {
    pub audit_id: AuditId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelAudit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAudit {
    pub audit_id: AuditId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCommand {
    Plan(PlanAudit),
    Assign(AssignCounter),
    Start(StartAudit),
    RecordCount(RecordCount),
    ReportMissing(ReportMissing),
    SetItemStatus(SetItemStatus),
    Reopen(ReopenItem),
    Complete(CompleteAudit),
    Cancel(CancelAudit),
}

/// Event: AuditPlanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPlanned {
    pub audit_id: AuditId,
    pub reference: String,
    pub warehouse_id: WarehouseId,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CounterAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAssigned {
    pub audit_id: AuditId,
    pub user_id: UserId,
    pub zones: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AuditStarted.
///
/// The expected-quantity snapshot: one line per inventory item of the
/// warehouse at start time, all materialized atomically with the status flip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStarted {
    pub audit_id: AuditId,
    pub lines: Vec<SnapshotLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemCounted.
///
/// Emitted for direct counts and derived missing-quantity reports alike;
/// `discrepancy` and `status` are computed at decision time and recorded as
/// facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounted {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub counted_quantity: i64,
    pub discrepancy: i64,
    pub status: AuditItemStatus,
    pub notes: Option<String>,
    pub counted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemStatusSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatusSet {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub status: AuditItemStatus,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemReopened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReopened {
    pub audit_id: AuditId,
    pub item_id: AuditItemId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AuditCompleted.
///
/// Carries every correction owed to live inventory (items with a recorded
/// count and non-zero variance). Status flip, item reconciliation, and the
/// correction list commit as one fact, which is what makes completion
/// exactly-once under concurrent callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCompleted {
    pub audit_id: AuditId,
    pub corrections: Vec<StockCorrection>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AuditCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCancelled {
    pub audit_id: AuditId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    AuditPlanned(AuditPlanned),
    CounterAssigned(CounterAssigned),
    AuditStarted(AuditStarted),
    ItemCounted(ItemCounted),
    ItemStatusSet(ItemStatusSet),
    ItemReopened(ItemReopened),
    AuditCompleted(AuditCompleted),
    AuditCancelled(AuditCancelled),
}

impl Event for AuditEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::AuditPlanned(_) => "audit.planned",
            AuditEvent::CounterAssigned(_) => "audit.counter_assigned",
            AuditEvent::AuditStarted(_) => "audit.started",
            AuditEvent::ItemCounted(_) => "audit.item_counted",
            AuditEvent::ItemStatusSet(_) => "audit.item_status_set",
            AuditEvent::ItemReopened(_) => "audit.item_reopened",
            AuditEvent::AuditCompleted(_) => "audit.completed",
            AuditEvent::AuditCancelled(_) => "audit.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::AuditPlanned(e) => e.occurred_at,
            AuditEvent::CounterAssigned(e) => e.occurred_at,
            AuditEvent::AuditStarted(e) => e.occurred_at,
            AuditEvent::ItemCounted(e) => e.occurred_at,
            AuditEvent::ItemStatusSet(e) => e.occurred_at,
            AuditEvent::ItemReopened(e) => e.occurred_at,
            AuditEvent::AuditCompleted(e) => e.occurred_at,
            AuditEvent::AuditCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Audit {
    type Command = AuditCommand;
    type Event = AuditEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AuditEvent::AuditPlanned(e) => {
                self.id = e.audit_id;
                self.reference = e.reference.clone();
                self.warehouse_id = Some(e.warehouse_id);
                self.status = AuditStatus::Planned;
                self.notes = e.notes.clone();
                self.created_by = Some(e.created_by);
                // Planned date until counting actually starts.
                self.start_date = Some(e.occurred_at);
                self.created = true;
            }
            AuditEvent::CounterAssigned(e) => {
                match self.assignments.iter_mut().find(|a| a.user_id == e.user_id) {
                    Some(a) => a.zones = e.zones.clone(),
                    None => self.assignments.push(Assignment {
                        user_id: e.user_id,
                        zones: e.zones.clone(),
                    }),
                }
            }
            AuditEvent::AuditStarted(e) => {
                self.status = AuditStatus::InProgress;
                self.start_date = Some(e.occurred_at);
                self.items = e.lines.iter().map(AuditItem::from_snapshot).collect();
            }
            AuditEvent::ItemCounted(e) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.id == e.item_id) {
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
                if let Some(item) = self.items.iter_mut().find(|i| i.id == e.item_id) {
                    item.status = e.status;
                    if e.notes.is_some() {
                        item.notes = e.notes.clone();
                    }
                }
            }
            AuditEvent::ItemReopened(e) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.id == e.item_id) {
                    item.status = AuditItemStatus::Pending;
                    item.counted_quantity = None;
                    item.discrepancy = None;
                    item.counted_by = None;
                    item.counted_at = None;
                }
            }
            AuditEvent::AuditCompleted(e) => {
                self.status = AuditStatus::Completed;
                self.end_date = Some(e.occurred_at);
                for item in &mut self.items {
                    if item.status == AuditItemStatus::Discrepancy {
                        item.status = AuditItemStatus::Reconciled;
                    }
                }
            }
            AuditEvent::AuditCancelled(_) => {
                self.status = AuditStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AuditCommand::Plan(cmd) => self.handle_plan(cmd),
            AuditCommand::Assign(cmd) => self.handle_assign(cmd),
            AuditCommand::Start(cmd) => self.handle_start(cmd),
            AuditCommand::RecordCount(cmd) => self.handle_record_count(cmd),
            AuditCommand::ReportMissing(cmd) => self.handle_report_missing(cmd),
            AuditCommand::SetItemStatus(cmd) => self.handle_set_item_status(cmd),
            AuditCommand::Reopen(cmd) => self.handle_reopen(cmd),
            AuditCommand::Complete(cmd) => self.handle_complete(cmd),
            AuditCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Audit {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_audit_id(&self, audit_id: AuditId) -> Result<(), DomainError> {
        if self.id != audit_id {
            return Err(DomainError::invalid_state("audit_id mismatch"));
        }
        Ok(())
    }

    fn ensure_in_progress(&self, what: &str) -> Result<(), DomainError> {
        if self.status != AuditStatus::InProgress {
            return Err(DomainError::invalid_state(format!(
                "{what} requires an in-progress audit"
            )));
        }
        Ok(())
    }

    fn item_or_not_found(&self, item_id: AuditItemId) -> Result<&AuditItem, DomainError> {
        self.item(item_id).ok_or(DomainError::NotFound)
    }

    /// Zone restriction: assigned counters may only touch their zones.
    fn ensure_zone_allowed(&self, user_id: UserId, item: &AuditItem) -> Result<(), DomainError> {
        if let Some(assignment) = self.assignments.iter().find(|a| a.user_id == user_id) {
            let zone = item.zone_label();
            if !assignment.zones.iter().any(|z| z == zone) {
                return Err(DomainError::Unauthorized);
            }
        }
        Ok(())
    }

    fn handle_plan(&self, cmd: &PlanAudit) -> Result<Vec<AuditEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("audit already exists"));
        }
        if cmd.reference.trim().is_empty() {
            return Err(DomainError::validation("reference cannot be empty"));
        }

        Ok(vec![AuditEvent::AuditPlanned(AuditPlanned {
            audit_id: cmd.audit_id,
            reference: cmd.reference.clone(),
            warehouse_id: cmd.warehouse_id,
            notes: cmd.notes.clone(),
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign(&self, cmd: &AssignCounter) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;

        if !matches!(self.status, AuditStatus::Planned | AuditStatus::InProgress) {
            return Err(DomainError::invalid_state(
                "counters can only be assigned to a planned or in-progress audit",
            ));
        }
        if cmd.zones.is_empty() {
            return Err(DomainError::validation("assignment must name at least one zone"));
        }
        if cmd.zones.iter().any(|z| z.trim().is_empty()) {
            return Err(DomainError::validation("zone identifiers cannot be empty"));
        }

        Ok(vec![AuditEvent::CounterAssigned(CounterAssigned {
            audit_id: cmd.audit_id,
            user_id: cmd.user_id,
            zones: cmd.zones.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start(&self, cmd: &StartAudit) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;

        if self.status != AuditStatus::Planned {
            return Err(DomainError::invalid_state(
                "only a planned audit can be started",
            ));
        }

        for line in &cmd.lines {
            if line.expected_quantity < 0 {
                return Err(DomainError::validation(
                    "snapshot expected quantity cannot be negative",
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for line in &cmd.lines {
            if !seen.insert(line.inventory_item_id) {
                return Err(DomainError::validation(
                    "snapshot contains duplicate inventory lines",
                ));
            }
        }

        Ok(vec![AuditEvent::AuditStarted(AuditStarted {
            audit_id: cmd.audit_id,
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Shared decision path for direct counts and missing-quantity reports.
    fn count_item(
        &self,
        item_id: AuditItemId,
        counted_quantity: i64,
        notes: Option<String>,
        counted_by: UserId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_in_progress("counting")?;
        let item = self.item_or_not_found(item_id)?;

        if counted_quantity < 0 {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        if item.is_locked() {
            return Err(DomainError::invalid_state(
                "item is already counted; reopen it to record a new count",
            ));
        }
        self.ensure_zone_allowed(counted_by, item)?;

        let discrepancy = counted_quantity - item.expected_quantity;
        let status = if discrepancy == 0 {
            AuditItemStatus::Counted
        } else {
            AuditItemStatus::Discrepancy
        };

        Ok(vec![AuditEvent::ItemCounted(ItemCounted {
            audit_id: self.id,
            item_id,
            counted_quantity,
            discrepancy,
            status,
            notes,
            counted_by,
            occurred_at,
        })])
    }

    fn handle_record_count(&self, cmd: &RecordCount) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;
        self.count_item(
            cmd.item_id,
            cmd.counted_quantity,
            cmd.notes.clone(),
            cmd.counted_by,
            cmd.occurred_at,
        )
    }

    fn handle_report_missing(&self, cmd: &ReportMissing) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;
        self.ensure_in_progress("counting")?;
        let item = self.item_or_not_found(cmd.item_id)?;

        if cmd.missing_quantity < 0 || cmd.missing_quantity > item.expected_quantity {
            return Err(DomainError::validation(
                "missing quantity must be between 0 and the expected quantity",
            ));
        }

        // A missing quantity of 0 therefore lands as a clean count.
        let counted_quantity = item.expected_quantity - cmd.missing_quantity;
        self.count_item(
            cmd.item_id,
            counted_quantity,
            cmd.notes.clone(),
            cmd.counted_by,
            cmd.occurred_at,
        )
    }

    fn handle_set_item_status(&self, cmd: &SetItemStatus) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;
        self.ensure_in_progress("item status changes")?;
        let item = self.item_or_not_found(cmd.item_id)?;

        // Idempotent: re-asserting the current status changes nothing.
        if item.status == cmd.status {
            return Ok(vec![]);
        }

        match (item.status, cmd.status) {
            (AuditItemStatus::Discrepancy, AuditItemStatus::Reconciled) => {
                Ok(vec![AuditEvent::ItemStatusSet(ItemStatusSet {
                    audit_id: self.id,
                    item_id: cmd.item_id,
                    status: cmd.status,
                    notes: cmd.notes.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            (_, AuditItemStatus::Pending) => Err(DomainError::invalid_state(
                "items do not return to pending through the status path; use reopen",
            )),
            (AuditItemStatus::Pending, _) => Err(DomainError::invalid_state(
                "item has no recorded count",
            )),
            (AuditItemStatus::Counted, _) | (AuditItemStatus::Reconciled, _) => Err(
                DomainError::invalid_state("item is locked; reopen it to make changes"),
            ),
            (AuditItemStatus::Discrepancy, _) => Err(DomainError::invalid_state(
                "a discrepancy can only be reconciled or recounted",
            )),
        }
    }

    fn handle_reopen(&self, cmd: &ReopenItem) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;
        self.ensure_in_progress("reopening an item")?;
        let item = self.item_or_not_found(cmd.item_id)?;

        if item.status == AuditItemStatus::Pending {
            return Ok(vec![]);
        }

        Ok(vec![AuditEvent::ItemReopened(ItemReopened {
            audit_id: self.id,
            item_id: cmd.item_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteAudit) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;

        if self.status != AuditStatus::InProgress {
            return Err(DomainError::invalid_state(
                "only an in-progress audit can be completed",
            ));
        }

        // Every recorded count with a variance owes live inventory a
        // correction; never-counted items keep their expectation and are
        // excluded.
        let corrections = self
            .items
            .iter()
            .filter(|i| i.counted_quantity.is_some() && i.has_variance())
            .map(|i| StockCorrection {
                audit_item_id: i.id,
                inventory_item_id: i.inventory_item_id,
                delta: i.discrepancy.unwrap_or(0),
            })
            .collect();

        Ok(vec![AuditEvent::AuditCompleted(AuditCompleted {
            audit_id: cmd.audit_id,
            corrections,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelAudit) -> Result<Vec<AuditEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_audit_id(cmd.audit_id)?;

        if !matches!(self.status, AuditStatus::Planned | AuditStatus::InProgress) {
            return Err(DomainError::invalid_state(
                "only a planned or in-progress audit can be cancelled",
            ));
        }

        Ok(vec![AuditEvent::AuditCancelled(AuditCancelled {
            audit_id: cmd.audit_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
