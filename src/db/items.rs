//! Item ingestion and read-only queries.

use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::{Db, ITEM_COLUMNS, WorkItemRow};
use crate::error::Result;
use crate::model::{
    IngestSummary, NewWorkItem, QueueStats, Stage, StageCounts, Status, WorkItem, WorkerLeases,
};
use crate::telemetry::metrics;

impl Db {
    /// Bulk upsert of work items keyed by id. Idempotent: re-ingesting an
    /// existing id refreshes `metadata` and leaves status and leases alone.
    pub async fn ingest(&self, items: &[NewWorkItem]) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut tx = self.pool().begin().await?;

        for item in items {
            if item.id.is_empty() {
                warn!("skipping ingest item with empty id");
                summary.skipped += 1;
                continue;
            }

            // xmax = 0 distinguishes a fresh insert from a conflict-update.
            let (inserted,): (bool,) = sqlx::query_as(
                "INSERT INTO work_items (id, metadata) \
                 VALUES ($1, $2) \
                 ON CONFLICT (id) DO UPDATE SET metadata = EXCLUDED.metadata, updated_at = now() \
                 RETURNING (xmax = 0)",
            )
            .bind(&item.id)
            .bind(&item.metadata)
            .fetch_one(&mut *tx)
            .await?;

            if inserted {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }

        tx.commit().await?;

        metrics::items_ingested().add(summary.inserted, &[KeyValue::new("result", "inserted")]);
        metrics::items_ingested().add(summary.updated, &[KeyValue::new("result", "updated")]);
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "ingested work items"
        );

        Ok(summary)
    }

    /// Get a work item by id.
    pub async fn get_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = $1");
        let row: Option<WorkItemRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(WorkItemRow::try_into_work_item).transpose()
    }

    /// List items, optionally filtered by a stage's status, oldest first.
    ///
    /// With a status but no stage, items matching in either stage are
    /// returned.
    pub async fn list_items(
        &self,
        stage: Option<Stage>,
        status: Option<Status>,
        limit: i64,
    ) -> Result<Vec<WorkItem>> {
        let filter = match (stage, status) {
            (_, None) => String::new(),
            (Some(stage), Some(_)) => format!("WHERE {}_status = $2", stage.as_str()),
            (None, Some(_)) => "WHERE (download_status = $2 OR upload_status = $2)".to_string(),
        };

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM work_items {filter} ORDER BY created_at ASC LIMIT $1"
        );

        let mut query = sqlx::query_as::<_, WorkItemRow>(&sql).bind(limit);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }

        let rows = query.fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    /// Aggregate queue health: per-stage status counts, per-worker lease
    /// counts, and the age of the oldest live lease.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let counts: (i64, i64, i64, i64, i64, i64, i64, i64, Option<i64>) = sqlx::query_as(
            "SELECT \
                 COUNT(*) FILTER (WHERE download_status = 'pending'), \
                 COUNT(*) FILTER (WHERE download_status = 'leased'), \
                 COUNT(*) FILTER (WHERE download_status = 'done'), \
                 COUNT(*) FILTER (WHERE download_status = 'failed'), \
                 COUNT(*) FILTER (WHERE upload_status = 'pending'), \
                 COUNT(*) FILTER (WHERE upload_status = 'leased'), \
                 COUNT(*) FILTER (WHERE upload_status = 'done'), \
                 COUNT(*) FILTER (WHERE upload_status = 'failed'), \
                 EXTRACT(EPOCH FROM now() - LEAST( \
                     MIN(download_leased_at) FILTER (WHERE download_status = 'leased'), \
                     MIN(upload_leased_at) FILTER (WHERE upload_status = 'leased') \
                 ))::bigint \
             FROM work_items",
        )
        .fetch_one(self.pool())
        .await?;

        let by_worker: Vec<(Option<String>, String, i64)> = sqlx::query_as(
            "SELECT download_leased_by, 'download', COUNT(*) FROM work_items \
             WHERE download_status = 'leased' GROUP BY 1 \
             UNION ALL \
             SELECT upload_leased_by, 'upload', COUNT(*) FROM work_items \
             WHERE upload_status = 'leased' GROUP BY 1 \
             ORDER BY 3 DESC",
        )
        .fetch_all(self.pool())
        .await?;

        let leases_by_worker = by_worker
            .into_iter()
            .filter_map(|(worker_id, stage, count)| {
                let stage = stage.parse().ok()?;
                Some(WorkerLeases {
                    worker_id: worker_id?,
                    stage,
                    count: count as u64,
                })
            })
            .collect();

        Ok(QueueStats {
            download: StageCounts {
                pending: counts.0 as u64,
                leased: counts.1 as u64,
                done: counts.2 as u64,
                failed: counts.3 as u64,
            },
            upload: StageCounts {
                pending: counts.4 as u64,
                leased: counts.5 as u64,
                done: counts.6 as u64,
                failed: counts.7 as u64,
            },
            leases_by_worker,
            oldest_lease_age_secs: counts.8,
        })
    }
}
