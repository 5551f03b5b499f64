//! Event listener for team factory events.
//!
//! This module provides:
//! - Per-event application to the mirrored state ([`apply`])
//! - Sync engine for historical backfill and the live subscription ([`sync`])

pub mod apply;
pub mod sync;

pub use apply::{
    Anomaly, ApplyOutcome, ApplyTally, EventSynchronizer, MetricsSnapshot, SyncMetrics,
};
pub use sync::SyncEngine;
