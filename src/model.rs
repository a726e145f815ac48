//! Core data model.
//!
//! A work item is one unit of acquisition work (e.g. a book to download,
//! then upload). It carries a per-stage lease state; the queue guarantees
//! at most one live lease per item per stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage. Upload-stage claims require the download stage to be
/// `Done`, so an item flows download → upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Upload,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Download, Stage::Upload];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Upload => "upload",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "download" => Ok(Stage::Download),
            "upload" => Ok(Stage::Upload),
            _ => Err(Error::Other(format!("unknown stage: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of one stage of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Eligible for claiming (subject to the stage's gating filter).
    Pending,
    /// Held by exactly one worker; `leased_by` identifies it.
    Leased,
    /// Finished successfully; `payload` holds the stage result.
    Done,
    /// Exhausted its lease cycle with an error. Only a reset returns it
    /// to `Pending`, never a worker acting on its own.
    Failed,
}

impl Status {
    /// Can a single lease cycle move from `self` to `to`?
    ///
    /// `Leased → Pending` is the early-release path; `Failed → Pending`
    /// is reserved for the reconciler or an explicit admin reset.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Leased)
                | (Leased, Done)
                | (Leased, Failed)
                | (Leased, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Leased => "leased",
            Status::Done => "done",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(Status::Pending),
            "leased" => Ok(Status::Leased),
            "done" => Ok(Status::Done),
            "failed" => Ok(Status::Failed),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// Lease state of one stage of a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: Status,
    /// Worker holding the lease. Non-empty iff `status == Leased`.
    pub leased_by: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    /// Result written on `Done` (download: local path; upload: share link).
    pub payload: Option<serde_json::Value>,
    /// Last failure message, written on `Failed`.
    pub error: Option<String>,
}

impl StageState {
    pub fn pending() -> Self {
        Self {
            status: Status::Pending,
            leased_by: None,
            leased_at: None,
            payload: None,
            error: None,
        }
    }
}

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable unique identifier, assigned at ingestion, never reused.
    pub id: String,

    /// Arbitrary per-domain data (title, author, source URLs). The queue
    /// doesn't interpret this.
    pub metadata: serde_json::Value,

    pub download: StageState,
    pub upload: StageState,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn stage(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Download => &self.download,
            Stage::Upload => &self.upload,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::Download => &mut self.download,
            Stage::Upload => &mut self.upload,
        }
    }

    /// Is this item claimable for the given stage right now?
    ///
    /// The upload stage is gated on the download stage's terminal success;
    /// the claim SQL applies the same predicate transactionally.
    pub fn eligible_for(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => self.download.status == Status::Pending,
            Stage::Upload => {
                self.upload.status == Status::Pending && self.download.status == Status::Done
            }
        }
    }
}

/// Input to ingestion. Re-ingesting an existing id updates `metadata` and
/// never touches status or leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub id: String,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl NewWorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: default_metadata(),
        }
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Operation inputs and outputs
// ---------------------------------------------------------------------------

/// Terminal outcome reported by a worker for one leased item.
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Done { payload: Option<serde_json::Value> },
    Failed { error: String },
}

/// Whether a report or release actually landed.
///
/// `Conflict` means the item was no longer leased (or leased by someone
/// else), the expected outcome of a late report racing a reclaim. It is
/// logged, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAck {
    Applied,
    Conflict,
}

/// Selects which rows a `reset` returns to the pending pool.
#[derive(Debug, Clone)]
pub struct ResetFilter {
    /// Only reclaim leases held by this worker.
    pub worker_id: Option<String>,
    /// Also reset aged `Failed` rows. Failed rows carry no leaseholder, so
    /// this is ignored when `worker_id` is set.
    pub include_failed: bool,
    /// Only rows whose `updated_at` is older than this.
    pub max_age: Duration,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageCounts {
    pub pending: u64,
    pub leased: u64,
    pub done: u64,
    pub failed: u64,
}

impl StageCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.done + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerLeases {
    pub worker_id: String,
    pub stage: Stage,
    pub count: u64,
}

/// Aggregate queue health, read by the reconciler and the query interface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub download: StageCounts,
    pub upload: StageCounts,
    pub leases_by_worker: Vec<WorkerLeases>,
    /// Age in seconds of the oldest live lease across both stages.
    pub oldest_lease_age_secs: Option<i64>,
}

impl QueueStats {
    pub fn stage(&self, stage: Stage) -> &StageCounts {
        match stage {
            Stage::Download => &self.download,
            Stage::Upload => &self.upload,
        }
    }
}

/// Result of a bulk ingestion call.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestSummary {
    pub inserted: u64,
    pub updated: u64,
    /// Items dropped for having an empty id.
    pub skipped: u64,
}
