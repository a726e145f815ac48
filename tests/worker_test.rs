//! Worker loop behavior against the in-memory queue: every claimed item
//! resolves to exactly one report or release, whatever the executor does.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MemoryQueue, RecordingNotifier, Script, ScriptedExecutor};
use fetchq::model::{Stage, Status};
use fetchq::notify::Notification;
use fetchq::queue::WorkQueue;
use fetchq::worker::{WorkerConfig, WorkerLoop};

fn test_worker(
    queue: Arc<MemoryQueue>,
    executor: Arc<ScriptedExecutor>,
    notifier: Arc<RecordingNotifier>,
    max_retries: u32,
) -> WorkerLoop<MemoryQueue, ScriptedExecutor> {
    WorkerLoop::new(
        queue,
        executor,
        notifier,
        WorkerConfig {
            worker_id: "worker-1".to_string(),
            stage: Stage::Download,
            batch_size: 10,
            max_retries,
            retry_base: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
        },
    )
}

#[tokio::test]
async fn drain_reports_every_claimed_item() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(5);

    let worker = test_worker(
        Arc::clone(&queue),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(RecordingNotifier::new()),
        3,
    );

    let stats = worker.drain().await.unwrap();
    assert_eq!(stats.claimed, 5);
    assert_eq!(stats.done, 5);
    assert_eq!(stats.failed, 0);

    let queue_stats = queue.stats().await.unwrap();
    assert_eq!(queue_stats.download.done, 5);
    assert_eq!(queue_stats.download.leased, 0);

    // Done items carry a payload.
    let item = queue.item("item-00").unwrap();
    assert_eq!(item.download.status, Status::Done);
    assert!(item.download.payload.is_some());
    assert!(item.download.leased_by.is_none());
}

#[tokio::test]
async fn drain_returns_immediately_on_empty_queue() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = test_worker(
        queue,
        Arc::new(ScriptedExecutor::new()),
        Arc::new(RecordingNotifier::new()),
        3,
    );

    let stats = worker.drain().await.unwrap();
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(1);
    let executor = Arc::new(
        ScriptedExecutor::new().with("item-00", Script::TransientThenSucceed(2)),
    );

    let worker = test_worker(
        Arc::clone(&queue),
        Arc::clone(&executor),
        Arc::new(RecordingNotifier::new()),
        3,
    );

    let stats = worker.drain().await.unwrap();
    assert_eq!(stats.done, 1);
    // Two failed attempts plus the successful one.
    assert_eq!(executor.attempts("item-00"), 3);
}

#[tokio::test]
async fn exhausted_retries_report_failed() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(1);
    let executor = Arc::new(ScriptedExecutor::new().with("item-00", Script::AlwaysTransient));

    let worker = test_worker(
        Arc::clone(&queue),
        Arc::clone(&executor),
        Arc::new(RecordingNotifier::new()),
        2,
    );

    let stats = worker.drain().await.unwrap();
    assert_eq!(stats.failed, 1);
    // Initial attempt + 2 retries.
    assert_eq!(executor.attempts("item-00"), 3);

    let item = queue.item("item-00").unwrap();
    assert_eq!(item.download.status, Status::Failed);
    assert!(item.download.error.as_deref().unwrap().contains("rate limited"));
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(1);
    let executor = Arc::new(ScriptedExecutor::new().with("item-00", Script::Permanent));

    let worker = test_worker(
        Arc::clone(&queue),
        Arc::clone(&executor),
        Arc::new(RecordingNotifier::new()),
        5,
    );

    let stats = worker.drain().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(executor.attempts("item-00"), 1);
}

#[tokio::test]
async fn executor_panic_resolves_to_failed_report() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(2);
    let executor = Arc::new(ScriptedExecutor::new().with("item-00", Script::Panic));

    let worker = test_worker(
        Arc::clone(&queue),
        executor,
        Arc::new(RecordingNotifier::new()),
        1,
    );

    let stats = worker.drain().await.unwrap();
    assert_eq!(stats.done, 1);
    assert_eq!(stats.failed, 1);

    // The panicking item is terminally Failed, not stranded in Leased.
    let item = queue.item("item-00").unwrap();
    assert_eq!(item.download.status, Status::Failed);
    assert!(item.download.leased_by.is_none());
}

#[tokio::test]
async fn unclaimable_item_is_released_for_other_workers() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(1);
    let executor = Arc::new(ScriptedExecutor::new().with("item-00", Script::Unclaimable));

    let worker = test_worker(
        Arc::clone(&queue),
        executor,
        Arc::new(RecordingNotifier::new()),
        3,
    );

    // Work one batch directly rather than draining, since a released item is
    // pending again and drain would re-claim it forever.
    let stats = worker.run_once().await.unwrap().unwrap();
    assert_eq!(stats.released, 1);

    let item = queue.item("item-00").unwrap();
    assert_eq!(item.download.status, Status::Pending);
    assert!(item.download.leased_by.is_none());

    // Another worker can claim it right away.
    let claimed = queue.claim(Stage::Download, 10, "worker-2").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "item-00");
}

#[tokio::test]
async fn batch_notification_carries_counts() {
    let queue = Arc::new(MemoryQueue::new());
    queue.seed(3);
    let executor = Arc::new(ScriptedExecutor::new().with("item-01", Script::Permanent));
    let notifier = Arc::new(RecordingNotifier::new());

    let worker = test_worker(Arc::clone(&queue), executor, Arc::clone(&notifier), 1);
    worker.drain().await.unwrap();

    let events = notifier.events();
    let batch = events
        .iter()
        .find_map(|event| match event {
            Notification::BatchFinished {
                stage,
                worker_id,
                done,
                failed,
            } => Some((*stage, worker_id.clone(), *done, *failed)),
            _ => None,
        })
        .expect("expected a BatchFinished notification");

    assert_eq!(batch.0, Stage::Download);
    assert_eq!(batch.1, "worker-1");
    assert_eq!(batch.2, 2);
    assert_eq!(batch.3, 1);
}
