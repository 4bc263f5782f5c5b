//! Audit orchestration: snapshot generation, counting entry points, and the
//! completion/cancellation controller.
//!
//! The aggregate decides; this module wires the decisions to the outside
//! world. Two rules keep reconciliation safe:
//!
//! - Completion is **exactly-once**: the `audit.completed` append carries the
//!   status flip and the full correction list in one fact, so of two
//!   concurrent completers exactly one commits (the loser sees the invalid
//!   state or loses the optimistic append).
//! - Correction propagation is **idempotent**: each inventory aggregate
//!   deduplicates corrections by audit id, so re-driving a partially
//!   propagated completion never double-adjusts stock.

use chrono::Utc;
use serde_json::Value as JsonValue;

use stocktake_audit::{
    audit_reference, AssignCounter, Audit, AuditCommand, AuditEvent, AuditId, AuditItemId,
    AuditItemStatus, CancelAudit, CompleteAudit, PlanAudit, RecordCount, ReopenItem,
    ReportMissing, SetItemStatus, SnapshotLine, StartAudit, StockCorrection,
};
use stocktake_core::{AggregateId, UserId, WarehouseId};
use stocktake_events::{EventBus, EventEnvelope};
use stocktake_inventory::{
    ApplyAuditCorrection, InventoryCommand, InventoryItem, InventoryItemId,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};
use crate::projections::stock_levels::StockReadModel;

/// Stream type identifier for audit aggregates.
pub const AUDIT_AGGREGATE_TYPE: &str = "audit";
/// Stream type identifier for inventory aggregates.
pub const INVENTORY_AGGREGATE_TYPE: &str = "inventory.item";

/// Bounded retry for optimistic-append races.
///
/// Counters working different items of the same audit contend on the audit
/// stream; a reload-and-redispatch serializes them without surfacing the
/// conflict to the user.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Read access to current stock, per warehouse.
///
/// Implemented by the stock read model; injected so the generator is testable
/// with fakes.
pub trait StockSnapshotSource: Send + Sync {
    fn warehouse_lines(&self, warehouse_id: WarehouseId) -> Vec<StockReadModel>;
}

impl<P> StockSnapshotSource for std::sync::Arc<P>
where
    P: StockSnapshotSource + ?Sized,
{
    fn warehouse_lines(&self, warehouse_id: WarehouseId) -> Vec<StockReadModel> {
        (**self).warehouse_lines(warehouse_id)
    }
}

impl<S> StockSnapshotSource for crate::projections::StockLevelsProjection<S>
where
    S: crate::read_model::ReadModelStore<InventoryItemId, StockReadModel>,
{
    fn warehouse_lines(&self, warehouse_id: WarehouseId) -> Vec<StockReadModel> {
        self.list_warehouse(warehouse_id)
    }
}

/// Result of planning an audit.
#[derive(Debug, Clone)]
pub struct NewAudit {
    pub audit_id: AuditId,
    pub reference: String,
}

/// Result of starting an audit.
#[derive(Debug, Clone, Copy)]
pub struct StartOutcome {
    pub items_created: usize,
}

/// Result of completing an audit.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOutcome {
    /// Corrections owed to live inventory by this audit.
    pub corrections: usize,
    /// Corrections applied by this call (0 for an already-propagated retry).
    pub adjustments_applied: usize,
}

/// Entry point for every audit workflow operation.
pub struct AuditOrchestrator<S, B, P> {
    dispatcher: CommandDispatcher<S, B>,
    stock: P,
}

impl<S, B, P> AuditOrchestrator<S, B, P>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    P: StockSnapshotSource,
{
    pub fn new(store: S, bus: B, stock: P) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            stock,
        }
    }

    /// Create an audit in PLANNED state with a generated reference number.
    pub fn plan_audit(
        &self,
        warehouse_id: WarehouseId,
        notes: Option<String>,
        created_by: UserId,
    ) -> Result<NewAudit, DispatchError> {
        let aggregate_id = AggregateId::new();
        let audit_id = AuditId::new(aggregate_id);
        let now = Utc::now();
        let reference = audit_reference(now.date_naive(), audit_id);

        self.dispatch_audit(
            audit_id,
            AuditCommand::Plan(PlanAudit {
                audit_id,
                reference: reference.clone(),
                warehouse_id,
                notes,
                created_by,
                occurred_at: now,
            }),
        )?;

        Ok(NewAudit {
            audit_id,
            reference,
        })
    }

    /// Snapshot the warehouse's stock into audit items and flip the audit to
    /// IN_PROGRESS, all in one append.
    pub fn start_audit(&self, audit_id: AuditId) -> Result<StartOutcome, DispatchError> {
        let audit = self.load_audit(audit_id)?;
        if !audit.exists() {
            return Err(DispatchError::NotFound);
        }
        let warehouse_id = audit.warehouse_id().ok_or(DispatchError::NotFound)?;

        let lines: Vec<SnapshotLine> = self
            .stock
            .warehouse_lines(warehouse_id)
            .into_iter()
            .map(|rm| SnapshotLine {
                audit_item_id: AuditItemId::new(AggregateId::new()),
                inventory_item_id: rm.item_id,
                product: rm.product,
                location: rm.location,
                expected_quantity: rm.on_hand,
            })
            .collect();
        let items_created = lines.len();

        self.dispatch_audit(
            audit_id,
            AuditCommand::Start(StartAudit {
                audit_id,
                lines,
                occurred_at: Utc::now(),
            }),
        )?;

        tracing::info!(%audit_id, items_created, "audit started");
        Ok(StartOutcome { items_created })
    }

    pub fn assign_counter(
        &self,
        audit_id: AuditId,
        user_id: UserId,
        zones: Vec<String>,
    ) -> Result<(), DispatchError> {
        self.dispatch_audit_with_retry(|| {
            AuditCommand::Assign(AssignCounter {
                audit_id,
                user_id,
                zones: zones.clone(),
                occurred_at: Utc::now(),
            })
        })
        .map(|_| ())
    }

    pub fn record_count(
        &self,
        audit_id: AuditId,
        item_id: AuditItemId,
        counted_quantity: i64,
        notes: Option<String>,
        counted_by: UserId,
    ) -> Result<(), DispatchError> {
        self.dispatch_audit_with_retry(|| {
            AuditCommand::RecordCount(RecordCount {
                audit_id,
                item_id,
                counted_quantity,
                notes: notes.clone(),
                counted_by,
                occurred_at: Utc::now(),
            })
        })
        .map(|_| ())
    }

    pub fn report_missing(
        &self,
        audit_id: AuditId,
        item_id: AuditItemId,
        missing_quantity: i64,
        notes: Option<String>,
        counted_by: UserId,
    ) -> Result<(), DispatchError> {
        self.dispatch_audit_with_retry(|| {
            AuditCommand::ReportMissing(ReportMissing {
                audit_id,
                item_id,
                missing_quantity,
                notes: notes.clone(),
                counted_by,
                occurred_at: Utc::now(),
            })
        })
        .map(|_| ())
    }

    pub fn set_item_status(
        &self,
        audit_id: AuditId,
        item_id: AuditItemId,
        status: AuditItemStatus,
        notes: Option<String>,
        requested_by: UserId,
    ) -> Result<(), DispatchError> {
        self.dispatch_audit_with_retry(|| {
            AuditCommand::SetItemStatus(SetItemStatus {
                audit_id,
                item_id,
                status,
                notes: notes.clone(),
                requested_by,
                occurred_at: Utc::now(),
            })
        })
        .map(|_| ())
    }

    pub fn reopen_item(
        &self,
        audit_id: AuditId,
        item_id: AuditItemId,
        requested_by: UserId,
    ) -> Result<(), DispatchError> {
        self.dispatch_audit_with_retry(|| {
            AuditCommand::Reopen(ReopenItem {
                audit_id,
                item_id,
                requested_by,
                occurred_at: Utc::now(),
            })
        })
        .map(|_| ())
    }

    /// Complete the audit and propagate accepted variances into inventory.
    ///
    /// The append is the single-writer guard: a concurrent completer loses
    /// with `InvalidState` or `Concurrency` and no corrections of its own.
    /// Propagation failures leave the committed correction list re-drivable
    /// (see [`Self::handle_audit_envelope`]).
    pub fn complete_audit(&self, audit_id: AuditId) -> Result<CompletionOutcome, DispatchError> {
        let committed = self.dispatch_audit(
            audit_id,
            AuditCommand::Complete(CompleteAudit {
                audit_id,
                occurred_at: Utc::now(),
            }),
        )?;

        let corrections = corrections_from_committed(&committed)?;
        let adjustments_applied = self.apply_corrections(audit_id, &corrections)?;

        tracing::info!(
            %audit_id,
            corrections = corrections.len(),
            adjustments_applied,
            "audit completed"
        );
        Ok(CompletionOutcome {
            corrections: corrections.len(),
            adjustments_applied,
        })
    }

    /// Cancel a planned or in-progress audit. No inventory effects.
    pub fn cancel_audit(&self, audit_id: AuditId) -> Result<(), DispatchError> {
        self.dispatch_audit_with_retry(|| {
            AuditCommand::Cancel(CancelAudit {
                audit_id,
                occurred_at: Utc::now(),
            })
        })
        .map(|_| ())
    }

    /// Write the corrections of one completed audit into inventory.
    ///
    /// Idempotent: an inventory aggregate that already recorded this audit's
    /// correction emits nothing. Returns the number of adjustments that
    /// actually applied in this call.
    pub fn apply_corrections(
        &self,
        audit_id: AuditId,
        corrections: &[StockCorrection],
    ) -> Result<usize, DispatchError> {
        let mut applied = 0;
        for correction in corrections {
            let committed = self.with_conflict_retry(|| {
                self.dispatcher.dispatch::<InventoryItem>(
                    correction.inventory_item_id.0,
                    INVENTORY_AGGREGATE_TYPE,
                    InventoryCommand::ApplyAuditCorrection(ApplyAuditCorrection {
                        item_id: correction.inventory_item_id,
                        audit_id: audit_id.0,
                        delta: correction.delta,
                        occurred_at: Utc::now(),
                    }),
                    |id| InventoryItem::empty(InventoryItemId::new(id)),
                )
            })?;
            if !committed.is_empty() {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// At-least-once safety net, fed from the bus: re-drive corrections for
    /// `audit.completed` envelopes. Everything else is ignored.
    pub fn handle_audit_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<usize, DispatchError> {
        if envelope.aggregate_type() != AUDIT_AGGREGATE_TYPE {
            return Ok(0);
        }

        let event: AuditEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;

        match event {
            AuditEvent::AuditCompleted(e) => self.apply_corrections(e.audit_id, &e.corrections),
            _ => Ok(0),
        }
    }

    /// Load and rehydrate the audit aggregate (read-only).
    pub fn load_audit(&self, audit_id: AuditId) -> Result<Audit, DispatchError> {
        self.dispatcher
            .load::<Audit>(audit_id.0, |id| Audit::empty(AuditId::new(id)))
    }

    fn dispatch_audit(
        &self,
        audit_id: AuditId,
        command: AuditCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher.dispatch::<Audit>(
            audit_id.0,
            AUDIT_AGGREGATE_TYPE,
            command,
            |id| Audit::empty(AuditId::new(id)),
        )
    }

    fn dispatch_audit_with_retry(
        &self,
        build: impl Fn() -> AuditCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.with_conflict_retry(|| {
            let command = build();
            let audit_id = match &command {
                AuditCommand::Plan(c) => c.audit_id,
                AuditCommand::Assign(c) => c.audit_id,
                AuditCommand::Start(c) => c.audit_id,
                AuditCommand::RecordCount(c) => c.audit_id,
                AuditCommand::ReportMissing(c) => c.audit_id,
                AuditCommand::SetItemStatus(c) => c.audit_id,
                AuditCommand::Reopen(c) => c.audit_id,
                AuditCommand::Complete(c) => c.audit_id,
                AuditCommand::Cancel(c) => c.audit_id,
            };
            self.dispatch_audit(audit_id, command)
        })
    }

    /// Retry an operation a bounded number of times on optimistic-append
    /// races; every attempt reloads fresh state through the dispatcher.
    fn with_conflict_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let mut attempts = 0;
        loop {
            match op() {
                Err(DispatchError::Concurrency(msg)) if attempts < MAX_CONFLICT_RETRIES => {
                    attempts += 1;
                    tracing::debug!(attempts, %msg, "optimistic append race, retrying");
                }
                other => return other,
            }
        }
    }
}

fn corrections_from_committed(
    committed: &[StoredEvent],
) -> Result<Vec<StockCorrection>, DispatchError> {
    for stored in committed {
        if stored.event_type != "audit.completed" {
            continue;
        }
        let event: AuditEvent = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        if let AuditEvent::AuditCompleted(e) = event {
            return Ok(e.corrections);
        }
    }
    Ok(vec![])
}
