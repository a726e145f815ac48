//! Worker control loop: claim → execute → report.
//!
//! Every claimed item resolves to exactly one report (or an explicit
//! release), no matter how the executor fails: transient errors retry
//! with backoff first, panics are contained, and only an unreachable
//! store aborts a batch (its leases then age out and are reclaimed).

pub mod executor;

pub use executor::{CommandExecutor, ExecError, Executor, ExecutorSpec};

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use crate::error::Result;
use crate::model::{ReportAck, Stage, WorkItem, WorkOutcome};
use crate::notify::{Notification, Notifier};
use crate::queue::WorkQueue;
use crate::telemetry::batch::{record_batch_outcome, start_batch_span};
use crate::telemetry::metrics;

/// Configuration for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub stage: Stage,
    pub batch_size: usize,
    /// Retries per item after the first attempt, for transient failures.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_base: Duration,
    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
}

/// Accumulated results of one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    pub released: usize,
}

impl BatchStats {
    fn absorb(&mut self, other: BatchStats) {
        self.claimed += other.claimed;
        self.done += other.done;
        self.failed += other.failed;
        self.released += other.released;
    }
}

#[derive(Clone, Copy)]
enum Resolution {
    Done,
    Failed,
    Released,
}

/// The claim → execute → report loop for one stage.
pub struct WorkerLoop<Q, E> {
    queue: Arc<Q>,
    executor: Arc<E>,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl<Q, E> Clone for WorkerLoop<Q, E> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            executor: Arc::clone(&self.executor),
            notifier: Arc::clone(&self.notifier),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl<Q, E> WorkerLoop<Q, E>
where
    Q: WorkQueue + 'static,
    E: Executor + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        executor: Arc<E>,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            notifier,
            config,
            shutdown: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal the loop to stop after the in-flight batch.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.shutdown.notify_one();
    }

    /// Run until the queue is drained: repeated claim cycles, stopping at
    /// the first empty claim.
    pub async fn drain(&self) -> Result<BatchStats> {
        let mut totals = BatchStats::default();
        while let Some(stats) = self.run_once().await? {
            totals.absorb(stats);
        }
        info!(
            worker_id = %self.config.worker_id,
            stage = %self.config.stage,
            claimed = totals.claimed,
            done = totals.done,
            failed = totals.failed,
            "queue drained"
        );
        Ok(totals)
    }

    /// Run continuously: poll when the queue is empty, back off and alert
    /// when the store is unreachable, stop on shutdown. Shutdown is only
    /// observed between batches so an in-flight batch always reports.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            stage = %self.config.stage,
            batch_size = self.config.batch_size,
            "worker started"
        );

        loop {
            if self.stopped.load(Ordering::Relaxed) {
                info!(worker_id = %self.config.worker_id, "worker shutting down");
                return Ok(());
            }

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    // No progress is possible without the store; this is
                    // the one alertable condition.
                    error!("claim cycle failed: {e}");
                    self.notifier
                        .notify(Notification::FatalError {
                            context: format!("worker {}", self.config.worker_id),
                            error: e.to_string(),
                        })
                        .await;
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!(worker_id = %self.config.worker_id, "worker shutting down");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Claim and work one batch. `None` means the queue had nothing for us.
    pub async fn run_once(&self) -> Result<Option<BatchStats>> {
        let items = self
            .queue
            .claim(
                self.config.stage,
                self.config.batch_size,
                &self.config.worker_id,
            )
            .await?;
        if items.is_empty() {
            return Ok(None);
        }

        let span = start_batch_span(self.config.stage, &self.config.worker_id, items.len());

        async {
            let mut stats = BatchStats {
                claimed: items.len(),
                ..BatchStats::default()
            };

            for item in items {
                match self.process_item(item).await? {
                    Resolution::Done => stats.done += 1,
                    Resolution::Failed => stats.failed += 1,
                    Resolution::Released => stats.released += 1,
                }
            }

            record_batch_outcome(&tracing::Span::current(), stats.done, stats.failed);

            self.notifier
                .notify(Notification::BatchFinished {
                    stage: self.config.stage,
                    worker_id: self.config.worker_id.clone(),
                    done: stats.done,
                    failed: stats.failed,
                })
                .await;

            Ok(Some(stats))
        }
        .instrument(span)
        .await
    }

    /// Execute one item and resolve it with exactly one report or release.
    async fn process_item(&self, item: WorkItem) -> Result<Resolution> {
        let stage = self.config.stage;
        let start = Instant::now();

        let (resolution, ack) = match self.execute_with_retry(&item).await {
            Ok(payload) => {
                let ack = self
                    .queue
                    .report(stage, &item.id, WorkOutcome::Done { payload })
                    .await?;
                (Resolution::Done, ack)
            }
            Err(ExecError::Unclaimable(reason)) => {
                warn!(item_id = %item.id, %reason, "releasing unclaimable item");
                let ack = self
                    .queue
                    .release(stage, &item.id, &self.config.worker_id)
                    .await?;
                (Resolution::Released, ack)
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "item failed");
                let ack = self
                    .queue
                    .report(
                        stage,
                        &item.id,
                        WorkOutcome::Failed {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                (Resolution::Failed, ack)
            }
        };

        if ack == ReportAck::Conflict {
            // Our lease was reclaimed while we worked; the item belongs to
            // someone else now and our result was discarded.
            warn!(item_id = %item.id, "lease lost before report landed");
        }

        metrics::execute_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new(
                    "outcome",
                    match resolution {
                        Resolution::Done => "done",
                        Resolution::Failed => "failed",
                        Resolution::Released => "released",
                    },
                ),
            ],
        );

        Ok(resolution)
    }

    /// Retry transient failures with exponential backoff before giving up.
    async fn execute_with_retry(
        &self,
        item: &WorkItem,
    ) -> std::result::Result<Option<serde_json::Value>, ExecError> {
        let mut attempt = 0u32;
        loop {
            match self.execute_guarded(item).await {
                Err(ExecError::Transient(reason)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(self.config.retry_base, attempt);
                    warn!(
                        item_id = %item.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Run the executor on its own task so a panic surfaces as a failure
    /// instead of unwinding through the loop and stranding the lease.
    async fn execute_guarded(
        &self,
        item: &WorkItem,
    ) -> std::result::Result<Option<serde_json::Value>, ExecError> {
        let executor = Arc::clone(&self.executor);
        let item = item.clone();
        match tokio::spawn(async move { executor.execute(&item).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ExecError::Permanent("executor panicked".to_string())),
            Err(e) => Err(ExecError::Transient(format!("executor task died: {e}"))),
        }
    }
}

/// Delay before retry `attempt` (1-based): base, 2·base, 4·base, …
/// capped at 64·base.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(6))
}
