//! Lease operations: atomic claim, report, release, reset.
//!
//! Both pipeline stages share this implementation; [`StageColumns`] selects
//! the column set and the upload stage's extra gating predicate. Expected
//! races (contended rows, late reports) resolve to empty results or
//! [`ReportAck::Conflict`]; only an unreachable store is an error.

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{Db, WorkItemRow};
use crate::error::Result;
use crate::model::{QueueStats, ReportAck, ResetFilter, Stage, WorkItem, WorkOutcome};
use crate::queue::{MAX_CLAIM_BATCH, WorkQueue, validate_worker_id};
use crate::telemetry::metrics;

/// Per-stage column names spliced into the lease SQL. Only these constants
/// ever reach the query text; all values go through binds.
struct StageColumns {
    status: &'static str,
    leased_by: &'static str,
    leased_at: &'static str,
    payload: &'static str,
    error: &'static str,
    /// Extra claim predicate; the upload stage is gated on the download
    /// stage's terminal success.
    claim_gate: &'static str,
}

const DOWNLOAD: StageColumns = StageColumns {
    status: "download_status",
    leased_by: "download_leased_by",
    leased_at: "download_leased_at",
    payload: "download_payload",
    error: "download_error",
    claim_gate: "",
};

const UPLOAD: StageColumns = StageColumns {
    status: "upload_status",
    leased_by: "upload_leased_by",
    leased_at: "upload_leased_at",
    payload: "upload_payload",
    error: "upload_error",
    claim_gate: " AND download_status = 'done'",
};

fn cols(stage: Stage) -> &'static StageColumns {
    match stage {
        Stage::Download => &DOWNLOAD,
        Stage::Upload => &UPLOAD,
    }
}

#[async_trait]
impl WorkQueue for Db {
    async fn claim(
        &self,
        stage: Stage,
        batch_size: usize,
        worker_id: &str,
    ) -> Result<Vec<WorkItem>> {
        validate_worker_id(worker_id)?;
        let batch_size = batch_size.min(MAX_CLAIM_BATCH);
        let c = cols(stage);
        let start = Instant::now();

        // Selection and transition commit as one statement: the CTE locks
        // eligible rows (skipping rows held by concurrent claims) and the
        // UPDATE stamps the lease before anything is released.
        let sql = format!(
            "WITH picked AS ( \
                 SELECT id FROM work_items \
                 WHERE {status} = 'pending'{gate} \
                 ORDER BY created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE work_items w \
             SET {status} = 'leased', {leased_by} = $2, {leased_at} = now(), updated_at = now() \
             FROM picked \
             WHERE w.id = picked.id \
             RETURNING w.*",
            status = c.status,
            gate = c.claim_gate,
            leased_by = c.leased_by,
            leased_at = c.leased_at,
        );

        let rows: Vec<WorkItemRow> = sqlx::query_as(&sql)
            .bind(batch_size as i64)
            .bind(worker_id)
            .fetch_all(self.pool())
            .await?;

        let items = rows
            .into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect::<Result<Vec<_>>>()?;

        metrics::claim_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("stage", stage.to_string())],
        );
        metrics::claims().add(
            1,
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new("result", if items.is_empty() { "empty" } else { "ok" }),
            ],
        );
        if !items.is_empty() {
            metrics::claimed_items().add(
                items.len() as u64,
                &[KeyValue::new("stage", stage.to_string())],
            );
            debug!(%stage, worker_id, count = items.len(), "claimed batch");
        }

        Ok(items)
    }

    async fn report(
        &self,
        stage: Stage,
        item_id: &str,
        outcome: WorkOutcome,
    ) -> Result<ReportAck> {
        let c = cols(stage);
        let (status, payload, error) = match outcome {
            WorkOutcome::Done { payload } => (
                "done",
                // Done always carries a payload, even a trivial one.
                Some(payload.unwrap_or_else(|| serde_json::json!({}))),
                None,
            ),
            WorkOutcome::Failed { error } => ("failed", None, Some(error)),
        };

        let sql = format!(
            "UPDATE work_items \
             SET {status_col} = $2, {leased_by} = NULL, {leased_at} = NULL, \
                 {payload_col} = COALESCE($3, {payload_col}), {error_col} = $4, \
                 updated_at = now() \
             WHERE id = $1 AND {status_col} = 'leased'",
            status_col = c.status,
            leased_by = c.leased_by,
            leased_at = c.leased_at,
            payload_col = c.payload,
            error_col = c.error,
        );

        let rows_affected = sqlx::query(&sql)
            .bind(item_id)
            .bind(status)
            .bind(&payload)
            .bind(&error)
            .execute(self.pool())
            .await?
            .rows_affected();

        let ack = if rows_affected == 0 {
            // Late report: the lease was reclaimed (or never existed).
            // The new owner's cycle must stay untouched.
            warn!(%stage, item_id, status, "report for item that is not leased, ignoring");
            ReportAck::Conflict
        } else {
            ReportAck::Applied
        };

        metrics::reports().add(
            1,
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new("outcome", status),
                KeyValue::new(
                    "ack",
                    if ack == ReportAck::Applied { "applied" } else { "conflict" },
                ),
            ],
        );

        Ok(ack)
    }

    async fn release(&self, stage: Stage, item_id: &str, worker_id: &str) -> Result<ReportAck> {
        validate_worker_id(worker_id)?;
        let c = cols(stage);

        let sql = format!(
            "UPDATE work_items \
             SET {status} = 'pending', {leased_by} = NULL, {leased_at} = NULL, updated_at = now() \
             WHERE id = $1 AND {status} = 'leased' AND {leased_by} = $2",
            status = c.status,
            leased_by = c.leased_by,
            leased_at = c.leased_at,
        );

        let rows_affected = sqlx::query(&sql)
            .bind(item_id)
            .bind(worker_id)
            .execute(self.pool())
            .await?
            .rows_affected();

        if rows_affected == 0 {
            warn!(%stage, item_id, worker_id, "release without a matching lease, ignoring");
            return Ok(ReportAck::Conflict);
        }

        metrics::releases().add(1, &[KeyValue::new("stage", stage.to_string())]);
        Ok(ReportAck::Applied)
    }

    async fn reset(&self, stage: Stage, filter: ResetFilter) -> Result<u64> {
        let c = cols(stage);
        // An unrepresentably large max_age saturates to "reset nothing".
        let cutoff = chrono::Duration::from_std(filter.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let sql = format!(
            "UPDATE work_items \
             SET {status} = 'pending', {leased_by} = NULL, {leased_at} = NULL, updated_at = now() \
             WHERE updated_at < $1 AND ( \
                    ({status} = 'leased' AND ($2::text IS NULL OR {leased_by} = $2)) \
                 OR ($3 AND {status} = 'failed' AND $2::text IS NULL) \
             )",
            status = c.status,
            leased_by = c.leased_by,
            leased_at = c.leased_at,
        );

        let count = sqlx::query(&sql)
            .bind(cutoff)
            .bind(&filter.worker_id)
            .bind(filter.include_failed)
            .execute(self.pool())
            .await?
            .rows_affected();

        if count > 0 {
            info!(
                %stage,
                count,
                worker_id = filter.worker_id.as_deref().unwrap_or("*"),
                include_failed = filter.include_failed,
                "reset items to pending"
            );
        }

        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.queue_stats().await
    }

    async fn get(&self, item_id: &str) -> Result<Option<WorkItem>> {
        self.get_item(item_id).await
    }
}
