//! Shared test doubles: an in-memory queue with a controllable clock, a
//! recording notifier, and a scripted executor.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use fetchq::error::Result;
use fetchq::model::{
    NewWorkItem, QueueStats, ReportAck, ResetFilter, Stage, StageState, Status, WorkItem,
    WorkOutcome, WorkerLeases,
};
use fetchq::notify::{Notification, Notifier};
use fetchq::queue::{MAX_CLAIM_BATCH, WorkQueue, validate_worker_id};
use fetchq::worker::{ExecError, Executor};

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

struct Inner {
    items: BTreeMap<String, WorkItem>,
    /// Simulated time offset; `advance` moves the queue's clock forward
    /// without sleeping.
    clock_offset: ChronoDuration,
    /// Monotonic ingestion order, encoded into created_at.
    seq: i64,
}

/// In-memory [`WorkQueue`] with the same claim/report/release/reset
/// semantics as the Postgres implementation.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: BTreeMap::new(),
                clock_offset: ChronoDuration::zero(),
                seq: 0,
            }),
        }
    }

    /// Ingest `count` items with ids `item-00`, `item-01`, …
    pub fn seed(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let id = format!("item-{i:02}");
                self.insert(NewWorkItem::new(&id));
                id
            })
            .collect()
    }

    /// Idempotent upsert keyed by id, like the real ingestion path.
    pub fn insert(&self, new: NewWorkItem) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_at(&inner);
        inner.seq += 1;
        let created_at = Utc
            .timestamp_opt(1_700_000_000 + inner.seq, 0)
            .single()
            .unwrap();
        if let Some(existing) = inner.items.get_mut(&new.id) {
            existing.metadata = new.metadata;
            existing.updated_at = now;
            return;
        }
        inner.items.insert(
            new.id.clone(),
            WorkItem {
                id: new.id,
                metadata: new.metadata,
                download: StageState::pending(),
                upload: StageState::pending(),
                created_at,
                updated_at: now,
            },
        );
    }

    /// Move the queue's clock forward.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock_offset += ChronoDuration::from_std(by).unwrap();
    }

    pub fn item(&self, id: &str) -> Option<WorkItem> {
        self.inner.lock().unwrap().items.get(id).cloned()
    }
}

fn now_at(inner: &Inner) -> DateTime<Utc> {
    Utc::now() + inner.clock_offset
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn claim(
        &self,
        stage: Stage,
        batch_size: usize,
        worker_id: &str,
    ) -> Result<Vec<WorkItem>> {
        validate_worker_id(worker_id)?;
        let batch_size = batch_size.min(MAX_CLAIM_BATCH);

        let mut inner = self.inner.lock().unwrap();
        let now = now_at(&inner);

        let mut eligible: Vec<String> = inner
            .items
            .values()
            .filter(|item| item.eligible_for(stage))
            .map(|item| item.id.clone())
            .collect();
        eligible.sort_by_key(|id| (inner.items[id].created_at, id.clone()));
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let item = inner.items.get_mut(&id).unwrap();
            let state = item.stage_mut(stage);
            state.status = Status::Leased;
            state.leased_by = Some(worker_id.to_string());
            state.leased_at = Some(now);
            item.updated_at = now;
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn report(
        &self,
        stage: Stage,
        item_id: &str,
        outcome: WorkOutcome,
    ) -> Result<ReportAck> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_at(&inner);

        let Some(item) = inner.items.get_mut(item_id) else {
            return Ok(ReportAck::Conflict);
        };
        let state = item.stage_mut(stage);
        if state.status != Status::Leased {
            return Ok(ReportAck::Conflict);
        }

        match outcome {
            WorkOutcome::Done { payload } => {
                state.status = Status::Done;
                state.payload = Some(payload.unwrap_or_else(|| serde_json::json!({})));
                state.error = None;
            }
            WorkOutcome::Failed { error } => {
                state.status = Status::Failed;
                state.error = Some(error);
            }
        }
        state.leased_by = None;
        state.leased_at = None;
        item.updated_at = now;
        Ok(ReportAck::Applied)
    }

    async fn release(&self, stage: Stage, item_id: &str, worker_id: &str) -> Result<ReportAck> {
        validate_worker_id(worker_id)?;
        let mut inner = self.inner.lock().unwrap();
        let now = now_at(&inner);

        let Some(item) = inner.items.get_mut(item_id) else {
            return Ok(ReportAck::Conflict);
        };
        let state = item.stage_mut(stage);
        if state.status != Status::Leased || state.leased_by.as_deref() != Some(worker_id) {
            return Ok(ReportAck::Conflict);
        }

        state.status = Status::Pending;
        state.leased_by = None;
        state.leased_at = None;
        item.updated_at = now;
        Ok(ReportAck::Applied)
    }

    async fn reset(&self, stage: Stage, filter: ResetFilter) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_at(&inner);
        let cutoff = now - ChronoDuration::from_std(filter.max_age).unwrap();

        let mut count = 0;
        for item in inner.items.values_mut() {
            if item.updated_at >= cutoff {
                continue;
            }
            let state = item.stage_mut(stage);
            let reclaim_lease = state.status == Status::Leased
                && filter
                    .worker_id
                    .as_deref()
                    .is_none_or(|w| state.leased_by.as_deref() == Some(w));
            let retry_failed = filter.include_failed
                && state.status == Status::Failed
                && filter.worker_id.is_none();
            if reclaim_lease || retry_failed {
                state.status = Status::Pending;
                state.leased_by = None;
                state.leased_at = None;
                item.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().unwrap();
        let now = now_at(&inner);

        let mut stats = QueueStats::default();
        let mut by_worker: HashMap<(String, Stage), u64> = HashMap::new();
        let mut oldest: Option<DateTime<Utc>> = None;

        for item in inner.items.values() {
            for stage in Stage::ALL {
                let state = item.stage(stage);
                let counts = match stage {
                    Stage::Download => &mut stats.download,
                    Stage::Upload => &mut stats.upload,
                };
                match state.status {
                    Status::Pending => counts.pending += 1,
                    Status::Leased => counts.leased += 1,
                    Status::Done => counts.done += 1,
                    Status::Failed => counts.failed += 1,
                }
                if state.status == Status::Leased {
                    if let Some(worker) = &state.leased_by {
                        *by_worker.entry((worker.clone(), stage)).or_default() += 1;
                    }
                    if let Some(leased_at) = state.leased_at {
                        oldest = Some(oldest.map_or(leased_at, |o| o.min(leased_at)));
                    }
                }
            }
        }

        stats.leases_by_worker = by_worker
            .into_iter()
            .map(|((worker_id, stage), count)| WorkerLeases {
                worker_id,
                stage,
                count,
            })
            .collect();
        stats.oldest_lease_age_secs = oldest.map(|at| (now - at).num_seconds());
        Ok(stats)
    }

    async fn get(&self, item_id: &str) -> Result<Option<WorkItem>> {
        Ok(self.item(item_id))
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Captures notifications for assertions.
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.events.lock().unwrap().push(notification);
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// Per-item behavior for [`ScriptedExecutor`].
#[derive(Debug, Clone)]
pub enum Script {
    /// Succeed with a payload naming the item.
    Succeed,
    /// Fail transiently this many times, then succeed.
    TransientThenSucceed(u32),
    AlwaysTransient,
    Permanent,
    Panic,
    Unclaimable,
}

/// Executor whose behavior is scripted per item id; unscripted items
/// succeed.
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(mut self, item_id: &str, script: Script) -> Self {
        self.scripts.insert(item_id.to_string(), script);
        self
    }

    /// How many times `execute` ran for this item.
    pub fn attempts(&self, item_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
    ) -> std::result::Result<Option<serde_json::Value>, ExecError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(item.id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        match self.scripts.get(&item.id).unwrap_or(&Script::Succeed) {
            Script::Succeed => Ok(Some(serde_json::json!({ "path": item.id }))),
            Script::TransientThenSucceed(failures) if attempt <= *failures => {
                Err(ExecError::Transient("flaky network".to_string()))
            }
            Script::TransientThenSucceed(_) => Ok(Some(serde_json::json!({ "path": item.id }))),
            Script::AlwaysTransient => Err(ExecError::Transient("rate limited".to_string())),
            Script::Permanent => Err(ExecError::Permanent("file gone upstream".to_string())),
            Script::Panic => panic!("scripted executor panic"),
            Script::Unclaimable => Err(ExecError::Unclaimable("no browser here".to_string())),
        }
    }
}
