//! Read-model projections.
//!
//! Projections consume published envelopes (JSON payloads) and maintain
//! disposable, rebuildable read models. They are idempotent under
//! at-least-once delivery: a per-stream cursor ignores replays and rejects
//! sequence gaps.

pub mod audits;
pub mod stock_levels;

use thiserror::Error;

pub use audits::{AuditItemFilter, AuditReadModel, AuditsProjection};
pub use stock_levels::{StockLevelsProjection, StockReadModel};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("event does not match envelope stream: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}
