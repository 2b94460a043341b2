//! Runner behaviour over the in-memory store
//!
//! Run with: cargo test -p accessory --test runner_test

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use accessory::pool::{ConnectionPool, PoolConfig};
use accessory::queue::{BackoffPolicy, QueueConfig, TaskContext, TaskQueue};
use accessory::storage::MemoryStore;
use accessory::task::{Tag, Task};
use accessory::trace::NoopTracer;
use accessory::Error;

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

fn create_queue(store: &MemoryStore, config: QueueConfig) -> Arc<TaskQueue<MemoryStore>> {
    let pool = ConnectionPool::new(
        store.clone(),
        PoolConfig::new().with_max_size(8).with_tracer(NoopTracer),
    );
    let config = config.with_poll_interval(Duration::from_millis(10));
    Arc::new(TaskQueue::new(Arc::new(pool), config).unwrap())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_runs_every_task() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q").with_workers(2));
    for i in 0..5 {
        q.enqueue([Tag::priority(i)]).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let done = Arc::new(AtomicUsize::new(0));
    let handler = {
        let done = Arc::clone(&done);
        let shutdown = shutdown.clone();
        move |_ctx: TaskContext, _task: Task| {
            let done = Arc::clone(&done);
            let shutdown = shutdown.clone();
            async move {
                if done.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    shutdown.cancel();
                }
                Ok(())
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 5);
    assert_eq!(store.count("tasks").await, 0);
    assert_eq!(q.pool().size(), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_failing_task_is_retried_then_discarded() {
    let store = MemoryStore::new();
    let q = create_queue(
        &store,
        QueueConfig::new("q")
            .with_workers(1)
            .with_max_retries(3)
            .with_backoff(BackoffPolicy::none()),
    );
    q.enqueue([]).await.unwrap();

    let shutdown = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = {
        let attempts = Arc::clone(&attempts);
        let shutdown = shutdown.clone();
        move |_ctx: TaskContext, _task: Task| {
            let attempts = Arc::clone(&attempts);
            let shutdown = shutdown.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    shutdown.cancel();
                }
                Err(anyhow::anyhow!("always fails"))
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(store.count("tasks").await, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_deadline_cancels_handler_token() {
    let store = MemoryStore::new();
    let q = create_queue(
        &store,
        QueueConfig::new("q")
            .with_workers(1)
            .with_deadline(Duration::from_millis(50)),
    );
    let task = q.enqueue([]).await.unwrap();

    let shutdown = CancellationToken::new();
    let observed = Arc::new(AtomicBool::new(false));
    let handler = {
        let observed = Arc::clone(&observed);
        let shutdown = shutdown.clone();
        move |ctx: TaskContext, _task: Task| {
            let observed = Arc::clone(&observed);
            let shutdown = shutdown.clone();
            async move {
                assert!(ctx.deadline().is_some());
                let cancelled =
                    tokio::time::timeout(Duration::from_secs(5), ctx.cancelled()).await;
                observed.store(cancelled.is_ok(), Ordering::SeqCst);
                shutdown.cancel();
                anyhow::bail!("deadline exceeded")
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    assert!(observed.load(Ordering::SeqCst));
    let stored = q.get(task.key().unwrap()).await.unwrap();
    assert_eq!(stored.retry_count(), 1);
    assert_eq!(stored.last_error(), Some("deadline exceeded"));
    assert_eq!(stored.claimed_at(), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_panic_counts_as_failure() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q").with_workers(1));
    let task = q.enqueue([]).await.unwrap();

    let shutdown = CancellationToken::new();
    let handler = {
        let shutdown = shutdown.clone();
        move |_ctx: TaskContext, task: Task| {
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancel();
                if task.retry_count() == 0 {
                    panic!("bad state");
                }
                Ok(())
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    let stored = q.get(task.key().unwrap()).await.unwrap();
    assert_eq!(stored.retry_count(), 1);
    assert!(stored.last_error().unwrap().contains("bad state"));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_shutdown_waits_for_in_flight_handler() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q").with_workers(2));
    q.enqueue([]).await.unwrap();

    let shutdown = CancellationToken::new();
    let finished = Arc::new(AtomicBool::new(false));
    let handler = {
        let finished = Arc::clone(&finished);
        let shutdown = shutdown.clone();
        move |_ctx: TaskContext, _task: Task| {
            let finished = Arc::clone(&finished);
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancel();
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(store.count("tasks").await, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrency_never_exceeds_workers() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q").with_workers(2));
    for _ in 0..10 {
        q.enqueue([]).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let handler = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        let shutdown = shutdown.clone();
        move |_ctx: TaskContext, _task: Task| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            let shutdown = shutdown.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                if done.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
                    shutdown.cancel();
                }
                Ok(())
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(store.count("tasks").await, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_buffered_tasks_are_abandoned_on_shutdown() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q").with_workers(1));
    let first = q.enqueue([Tag::priority(10)]).await.unwrap();
    let second = q.enqueue([Tag::priority(1)]).await.unwrap();

    let shutdown = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        let shutdown = shutdown.clone();
        move |_ctx: TaskContext, _task: Task| {
            let calls = Arc::clone(&calls);
            let shutdown = shutdown.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Long enough for the poll loop to claim and buffer the next task
                tokio::time::sleep(Duration::from_millis(300)).await;
                shutdown.cancel();
                Ok(())
            }
        }
    };

    tokio::time::timeout(RUN_TIMEOUT, Arc::clone(&q).run(shutdown, handler))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(q.get(first.key().unwrap()).await.is_err());

    let stored = q.get(second.key().unwrap()).await.unwrap();
    assert_eq!(stored.claimed_at(), None);
    assert_eq!(stored.retry_count(), 0);
    assert_eq!(store.count("tasks").await, 1);
}

#[tokio::test]
async fn test_run_after_shutdown_is_out_of_order() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q").with_workers(1));

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let err = q
        .run(shutdown, |_ctx, _task| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OutOfOrder(_)));
}
