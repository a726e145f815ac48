//! Periodic sweep returning expired leases to the pending pool.
//!
//! A worker that dies mid-batch leaves its items leased; nobody else can
//! claim them. The reconciler is the only path back: any lease whose row
//! hasn't moved within the lease timeout is reset to pending. Every
//! operation here is an idempotent reset, so the reconciler itself can be
//! killed and restarted at any time without corrupting state.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::Result;
use crate::model::{ResetFilter, Stage, Status};
use crate::notify::{Notification, Notifier};
use crate::queue::WorkQueue;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Leases older than this are considered abandoned.
    pub lease_timeout: Duration,
    /// When set, `Failed` items older than this also return to pending
    /// for another attempt.
    pub failed_retry_age: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(1800),
            failed_retry_age: None,
        }
    }
}

/// Results of one sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub reclaimed_download: u64,
    pub reclaimed_upload: u64,
    pub failed_retried: u64,
}

impl SweepReport {
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed_download + self.reclaimed_upload
    }
}

pub struct Reconciler<Q> {
    queue: Arc<Q>,
    notifier: Arc<dyn Notifier>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl<Q> Clone for Reconciler<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            notifier: Arc::clone(&self.notifier),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<Q: WorkQueue> Reconciler<Q> {
    pub fn new(queue: Arc<Q>, notifier: Arc<dyn Notifier>, config: ReconcilerConfig) -> Self {
        Self {
            queue,
            notifier,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop before the next sweep.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run sweeps on the configured interval until shutdown. A failing
    /// sweep (store unreachable) is logged and alerted, then retried on
    /// the next tick.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            lease_timeout_secs = self.config.lease_timeout.as_secs(),
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reconciler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            if let Err(e) = self.sweep().await {
                error!("sweep failed: {e}");
                self.notifier
                    .notify(Notification::FatalError {
                        context: "reconciler".to_string(),
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// One pass: reclaim expired leases per stage, optionally retry aged
    /// failures, then publish queue health.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for stage in Stage::ALL {
            let reclaimed = self
                .queue
                .reset(
                    stage,
                    ResetFilter {
                        worker_id: None,
                        include_failed: false,
                        max_age: self.config.lease_timeout,
                    },
                )
                .await?;

            match stage {
                Stage::Download => report.reclaimed_download = reclaimed,
                Stage::Upload => report.reclaimed_upload = reclaimed,
            }

            if reclaimed > 0 {
                metrics::leases_reclaimed()
                    .add(reclaimed, &[KeyValue::new("stage", stage.to_string())]);
                self.notifier
                    .notify(Notification::LeasesReclaimed {
                        stage,
                        count: reclaimed,
                    })
                    .await;
            }

            if let Some(age) = self.config.failed_retry_age {
                report.failed_retried += self
                    .queue
                    .reset(
                        stage,
                        ResetFilter {
                            worker_id: None,
                            include_failed: true,
                            max_age: age,
                        },
                    )
                    .await?;
            }
        }

        self.publish_health().await?;
        Ok(report)
    }

    async fn publish_health(&self) -> Result<()> {
        let stats = self.queue.stats().await?;

        for stage in Stage::ALL {
            let counts = stats.stage(stage);
            for (status, value) in [
                (Status::Pending, counts.pending),
                (Status::Leased, counts.leased),
                (Status::Done, counts.done),
                (Status::Failed, counts.failed),
            ] {
                metrics::queue_depth().record(
                    value,
                    &[
                        KeyValue::new("stage", stage.to_string()),
                        KeyValue::new("status", status.to_string()),
                    ],
                );
            }
        }

        if let Some(age) = stats.oldest_lease_age_secs {
            metrics::oldest_lease_age().record(age.max(0) as u64, &[]);
        }

        Ok(())
    }
}
