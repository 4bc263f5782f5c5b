//! Audit domain module (event-sourced).
//!
//! A stock audit is one bounded counting exercise against one warehouse. The
//! [`Audit`] aggregate exclusively owns its line items, so one event stream is
//! the transaction boundary for snapshot generation, counting, and
//! completion: every mutation is an atomic, optimistically-versioned append.
//!
//! Pure domain logic only — reading live stock and writing corrections back
//! happens in the orchestration layer.

pub mod audit;
pub mod metrics;
pub mod reference;

pub use audit::{
    AssignCounter, Assignment, Audit, AuditCancelled, AuditCommand, AuditCompleted, AuditEvent,
    AuditId, AuditItem, AuditItemId, AuditItemStatus, AuditPlanned, AuditStarted, AuditStatus,
    CancelAudit, CompleteAudit, CounterAssigned, ItemCounted, ItemReopened, ItemStatusSet,
    PlanAudit, RecordCount, ReopenItem, ReportMissing, SetItemStatus, SnapshotLine,
    StockCorrection, StartAudit,
};
pub use metrics::{progress, zone_breakdown, AuditProgress, ZoneProgress};
pub use reference::audit_reference;
