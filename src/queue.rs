//! The lease protocol interface.
//!
//! Everything that mutates work items goes through these four operations;
//! workers and the reconciler are written against the trait so they can be
//! exercised without a live Postgres.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{QueueStats, ReportAck, ResetFilter, Stage, WorkItem, WorkOutcome};

/// Claims are capped per call so one worker cannot starve the others and
/// so a single claim transaction stays short.
pub const MAX_CLAIM_BATCH: usize = 20;

/// Upper bound on worker identifiers stored in lease columns.
pub const MAX_WORKER_ID_LEN: usize = 64;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Atomically claim up to `batch_size` eligible items for `stage`.
    ///
    /// Rows locked by a concurrent claim are skipped, not waited on, so
    /// contention degrades to a smaller batch. Returns what is available:
    /// possibly empty, never an error for an empty pool.
    async fn claim(&self, stage: Stage, batch_size: usize, worker_id: &str)
    -> Result<Vec<WorkItem>>;

    /// Resolve a leased item to a terminal outcome.
    ///
    /// Reporting an item that is no longer leased is a no-op returning
    /// [`ReportAck::Conflict`]; a late report must never clobber a new
    /// owner's lease.
    async fn report(&self, stage: Stage, item_id: &str, outcome: WorkOutcome)
    -> Result<ReportAck>;

    /// Return a leased item to the pending pool without waiting for lease
    /// expiry. Only the current leaseholder may release.
    async fn release(&self, stage: Stage, item_id: &str, worker_id: &str) -> Result<ReportAck>;

    /// Bulk-reset aged leases (and optionally aged failures) to pending.
    /// Idempotent; returns the number of rows reset.
    async fn reset(&self, stage: Stage, filter: ResetFilter) -> Result<u64>;

    /// Aggregate counts and lease health. Read-only.
    async fn stats(&self) -> Result<QueueStats>;

    /// Fetch one item by id. Read-only; `None` for unknown ids.
    async fn get(&self, item_id: &str) -> Result<Option<WorkItem>>;
}

/// Reject worker ids that would corrupt lease accounting.
pub fn validate_worker_id(worker_id: &str) -> Result<()> {
    if worker_id.is_empty() || worker_id.len() > MAX_WORKER_ID_LEN {
        return Err(Error::InvalidWorkerId(worker_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_bounds() {
        assert!(validate_worker_id("worker-1").is_ok());
        assert!(validate_worker_id("").is_err());
        assert!(validate_worker_id(&"x".repeat(MAX_WORKER_ID_LEN)).is_ok());
        assert!(validate_worker_id(&"x".repeat(MAX_WORKER_ID_LEN + 1)).is_err());
    }
}
