//! Integration tests for the worker pool.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;
use workvault::config::{PoolConfig, QueueConfig, RecordStoreConfig};
use workvault::engine::WorkerPool;
use workvault::error::Error;
use workvault::handler::{HandlerRegistry, from_fn};
use workvault::model::{Job, NewJob, Outcome};
use workvault::queue::{DurableQueue, QueueStats};
use workvault::records::ShardedRecordStore;

fn queue_config() -> QueueConfig {
    QueueConfig {
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        ..QueueConfig::default()
    }
}

fn pool_config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        lease_duration: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        job_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(5),
    }
}

async fn open_queue(dir: &Path) -> Arc<DurableQueue> {
    Arc::new(DurableQueue::open(dir, queue_config()).await.unwrap())
}

async fn wait_for(queue: &DurableQueue, pred: impl Fn(&QueueStats) -> bool) -> QueueStats {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = queue.stats().await;
        if pred(&stats) {
            return stats;
        }
        assert!(Instant::now() < deadline, "timed out waiting, last stats: {stats:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn start(pool: &Arc<WorkerPool>) -> tokio::task::JoinHandle<workvault::Result<()>> {
    let pool = Arc::clone(pool);
    tokio::spawn(async move { pool.run().await })
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_refuses_kinds_without_handlers() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(
        DurableQueue::open(
            dir.path(),
            QueueConfig {
                kinds: vec!["render".into(), "score".into()],
                ..queue_config()
            },
        )
        .await
        .unwrap(),
    );
    let mut registry = HandlerRegistry::new();
    registry.register("render", from_fn(|_| async { Outcome::Success }));

    let result = WorkerPool::new(queue, Arc::new(registry), pool_config(2));
    assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("score")));
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_drain_the_queue_into_records() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir.path().join("queue")).await;
    let records: Arc<ShardedRecordStore<u64>> = Arc::new(
        ShardedRecordStore::open(dir.path().join("records"), &RecordStoreConfig::default())
            .await
            .unwrap(),
    );

    let mut registry = HandlerRegistry::new();
    let store = Arc::clone(&records);
    registry.register(
        "count",
        from_fn(move |job: Job| {
            let store = Arc::clone(&store);
            async move {
                let entity = job.payload["entity"].as_str().unwrap_or("none").to_string();
                match store.update(&entity, |n| *n += 1).await {
                    Ok(_) => Outcome::Success,
                    Err(e) => Outcome::retryable(e.to_string()),
                }
            }
        }),
    );

    for n in 0..40 {
        let entity = format!("user-{}", n % 4);
        queue
            .enqueue(NewJob::new("count", json!({ "entity": entity })))
            .await
            .unwrap();
    }

    let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(registry), pool_config(4)).unwrap();
    let pool = Arc::new(pool);
    let runner = start(&pool);

    wait_for(&queue, |s| s.done == 40).await;
    pool.shutdown_handle().shutdown();
    runner.await.unwrap().unwrap();

    for n in 0..4 {
        let record = records.get(&format!("user-{n}")).await.unwrap().unwrap();
        assert_eq!(record.data, 10);
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_worker_count() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(dir.path()).await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
        registry.register(
            "slow",
            from_fn(move |_| {
                let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Outcome::Success
                }
            }),
        );
    }
    for _ in 0..12 {
        queue.enqueue(NewJob::new("slow", json!({}))).await.unwrap();
    }

    let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(registry), pool_config(3)).unwrap();
    let pool = Arc::new(pool);
    let runner = start(&pool);
    wait_for(&queue, |s| s.done == 12).await;
    pool.shutdown_handle().shutdown();
    runner.await.unwrap().unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn panicking_handler_is_retried() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(dir.path()).await;

    let mut registry = HandlerRegistry::new();
    registry.register(
        "fragile",
        from_fn(|job: Job| async move {
            if job.attempts == 0 {
                panic!("first delivery always explodes");
            }
            Outcome::Success
        }),
    );
    queue.enqueue(NewJob::new("fragile", json!({}))).await.unwrap();

    let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(registry), pool_config(1)).unwrap();
    let pool = Arc::new(pool);
    let runner = start(&pool);
    let stats = wait_for(&queue, |s| s.done == 1).await;
    pool.shutdown_handle().shutdown();
    runner.await.unwrap().unwrap();

    assert_eq!(stats.dead, 0);
}

#[tokio::test]
async fn slow_handler_times_out_and_is_retried() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(dir.path()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let calls = Arc::clone(&calls);
        registry.register(
            "sleepy",
            from_fn(move |job: Job| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if job.attempts == 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Outcome::Success
                }
            }),
        );
    }
    queue.enqueue(NewJob::new("sleepy", json!({}))).await.unwrap();

    let config = PoolConfig {
        job_timeout: Duration::from_millis(50),
        ..pool_config(1)
    };
    let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), Arc::new(registry), config).unwrap());
    let runner = start(&pool);
    wait_for(&queue, |s| s.done == 1).await;
    pool.shutdown_handle().shutdown();
    runner.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn jobs_without_a_handler_are_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(dir.path()).await;
    let mut registry = HandlerRegistry::new();
    registry.register("known", from_fn(|_| async { Outcome::Success }));
    queue.enqueue(NewJob::new("unknown", json!({}))).await.unwrap();

    let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(registry), pool_config(1)).unwrap();
    let pool = Arc::new(pool);
    let runner = start(&pool);
    wait_for(&queue, |s| s.dead == 1).await;
    pool.shutdown_handle().shutdown();
    runner.await.unwrap().unwrap();

    let letters = queue.dead_letters(1).await.unwrap();
    assert!(letters[0].final_error.contains("unknown"));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_cut_off_by_shutdown_are_redelivered() {
    let dir = TempDir::new().unwrap();
    let id = {
        let queue = open_queue(dir.path()).await;
        let mut registry = HandlerRegistry::new();
        registry.register(
            "endless",
            from_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Outcome::Success
            }),
        );
        let id = queue.enqueue(NewJob::new("endless", json!({}))).await.unwrap();

        let config = PoolConfig {
            lease_duration: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(50),
            ..pool_config(1)
        };
        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(registry), config).unwrap();
        let pool = Arc::new(pool);
        let runner = start(&pool);
        wait_for(&queue, |s| s.inflight == 1).await;

        pool.shutdown_handle().shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("pool ignored the grace period")
            .unwrap()
            .unwrap();

        // Not acked, not lost.
        let stats = queue.stats().await;
        assert_eq!((stats.done, stats.dead, stats.inflight), (0, 0, 1));
        id
    };

    tokio::time::sleep(Duration::from_millis(250)).await;
    let queue = open_queue(dir.path()).await;
    let leased = queue.lease_batch(1, Duration::from_secs(60)).await.unwrap();
    assert_eq!(leased.iter().map(|j| j.id).collect::<Vec<_>>(), [id]);
}

#[tokio::test]
async fn idle_pool_stops_promptly() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(dir.path()).await;
    let mut registry = HandlerRegistry::new();
    registry.register("noop", from_fn(|_| async { Outcome::Success }));

    let pool = Arc::new(WorkerPool::new(queue, Arc::new(registry), pool_config(4)).unwrap());
    let runner = start(&pool);
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.shutdown_handle().shutdown();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("idle workers did not stop")
        .unwrap()
        .unwrap();
}
