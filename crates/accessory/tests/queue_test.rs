//! Queue behaviour over the in-memory store
//!
//! Run with: cargo test -p accessory --test queue_test

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use accessory::pool::{ConnectionPool, PoolConfig};
use accessory::queue::{BackoffPolicy, DiscardReason, QueueConfig, ReleaseOutcome, TaskQueue};
use accessory::storage::MemoryStore;
use accessory::task::{Tag, TagType, TagValue};
use accessory::trace::NoopTracer;
use accessory::Error;

fn create_queue(store: &MemoryStore, config: QueueConfig) -> Arc<TaskQueue<MemoryStore>> {
    let pool = ConnectionPool::new(
        store.clone(),
        PoolConfig::new().with_max_size(16).with_tracer(NoopTracer),
    );
    Arc::new(TaskQueue::new(Arc::new(pool), config).unwrap())
}

// ============================================
// Claim ordering
// ============================================

#[tokio::test]
async fn test_higher_priority_first() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q"));
    let low = q.enqueue([Tag::priority(1)]).await.unwrap();
    let high = q.enqueue([Tag::priority(10)]).await.unwrap();

    let first = q.retain().await.unwrap().unwrap();
    assert_eq!(first.key(), high.key());
    let second = q.retain().await.unwrap().unwrap();
    assert_eq!(second.key(), low.key());
    assert!(q.retain().await.unwrap().is_none());
}

#[tokio::test]
async fn test_earlier_schedule_breaks_ties() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q"));
    let now = Utc::now();
    let later = q
        .enqueue([Tag::scheduled_at(now - ChronoDuration::seconds(1))])
        .await
        .unwrap();
    let earlier = q
        .enqueue([Tag::scheduled_at(now - ChronoDuration::seconds(30))])
        .await
        .unwrap();

    assert_eq!(q.retain().await.unwrap().unwrap().key(), earlier.key());
    assert_eq!(q.retain().await.unwrap().unwrap().key(), later.key());
}

#[tokio::test]
async fn test_future_task_not_claimable() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q"));
    q.enqueue([Tag::scheduled_at(Utc::now() + ChronoDuration::hours(1))])
        .await
        .unwrap();

    assert!(q.retain().await.unwrap().is_none());
    assert_eq!(store.count("tasks").await, 1);
}

// ============================================
// Release
// ============================================

#[tokio::test]
async fn test_claim_release_cycle() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q"));
    let task = q.enqueue([Tag::priority(5)]).await.unwrap();

    let claimed = q.retain().await.unwrap().unwrap();
    assert_eq!(claimed.key(), task.key());
    assert!(claimed.claimed_at().is_some());
    assert!(q.retain().await.unwrap().is_none());

    assert_eq!(
        q.release(&claimed, None).await.unwrap(),
        ReleaseOutcome::Completed
    );
    assert!(q.retain().await.unwrap().is_none());
    assert!(matches!(
        q.get(task.key().unwrap()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_retry_becomes_claimable_after_backoff() {
    let store = MemoryStore::new();
    let q = create_queue(
        &store,
        QueueConfig::new("q").with_backoff(BackoffPolicy::fixed(Duration::from_millis(100))),
    );
    q.enqueue([]).await.unwrap();
    let task = q.retain().await.unwrap().unwrap();

    let outcome = q.release(&task, Some("flaky".into())).await.unwrap();
    assert!(matches!(
        outcome,
        ReleaseOutcome::Rescheduled { retry_count: 1, .. }
    ));
    assert!(q.retain().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let again = q.retain().await.unwrap().unwrap();
    assert_eq!(again.key(), task.key());
    assert_eq!(again.retry_count(), 1);
    assert_eq!(again.last_error(), Some("flaky"));
    assert_eq!(
        again.get(&TagType::LastError),
        Some(TagValue::Text("flaky".into()))
    );
}

#[tokio::test]
async fn test_single_retry_ceiling_discards() {
    let store = MemoryStore::new();
    let q = create_queue(
        &store,
        QueueConfig::new("q")
            .with_max_retries(1)
            .with_backoff(BackoffPolicy::none()),
    );
    q.enqueue([Tag::priority(5)]).await.unwrap();
    let task = q.retain().await.unwrap().unwrap();

    let outcome = q.release(&task, Some("boom".into())).await.unwrap();
    assert_eq!(
        outcome,
        ReleaseOutcome::Discarded {
            retry_count: 1,
            reason: DiscardReason::RetriesExhausted,
        }
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(q.retain().await.unwrap().is_none());
}

#[tokio::test]
async fn test_retries_until_ceiling() {
    let store = MemoryStore::new();
    let q = create_queue(
        &store,
        QueueConfig::new("q")
            .with_max_retries(3)
            .with_backoff(BackoffPolicy::none()),
    );
    q.enqueue([]).await.unwrap();

    let mut outcomes = Vec::new();
    while let Some(task) = q.retain().await.unwrap() {
        outcomes.push(q.release(&task, Some("boom".into())).await.unwrap());
    }

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(
        outcomes[2],
        ReleaseOutcome::Discarded {
            retry_count: 3,
            reason: DiscardReason::RetriesExhausted
        }
    ));
    assert_eq!(store.count("tasks").await, 0);
}

#[tokio::test]
async fn test_max_age_expires_retries() {
    let store = MemoryStore::new();
    let q = create_queue(
        &store,
        QueueConfig::new("q")
            .with_max_age(Duration::from_secs(30))
            .with_backoff(BackoffPolicy::linear(Duration::from_secs(60))),
    );
    q.enqueue([]).await.unwrap();
    let task = q.retain().await.unwrap().unwrap();

    let outcome = q.release(&task, Some("boom".into())).await.unwrap();
    assert_eq!(
        outcome,
        ReleaseOutcome::Discarded {
            retry_count: 1,
            reason: DiscardReason::Expired,
        }
    );
}

// ============================================
// Concurrency
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let store = MemoryStore::new();
    let q = create_queue(&store, QueueConfig::new("q"));
    for i in 0..40 {
        q.enqueue([Tag::priority(i % 3)]).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let q = Arc::clone(&q);
        handles.push(tokio::spawn(async move {
            let mut keys = Vec::new();
            while let Some(task) = q.retain().await.unwrap() {
                keys.push(task.key().unwrap());
            }
            keys
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for key in handle.await.unwrap() {
            assert!(seen.insert(key), "task {key} claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
async fn test_pool_capacity_scenario() {
    let store = MemoryStore::new();
    let pool = ConnectionPool::new(
        store,
        PoolConfig::new().with_max_size(2).with_tracer(NoopTracer),
    );

    let (a, b, c) = tokio::join!(pool.get(), pool.get(), pool.get());
    let granted = [a.is_some(), b.is_some(), c.is_some()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(granted, 2);
    assert_eq!(pool.size(), 2);

    let held = if a.is_some() { a } else { b };
    pool.put(held);
    assert!(pool.get().await.is_some());
}

#[tokio::test]
async fn test_namespaces_share_a_pool() {
    let store = MemoryStore::new();
    let pool = Arc::new(ConnectionPool::new(
        store.clone(),
        PoolConfig::new().with_max_size(2).with_tracer(NoopTracer),
    ));
    let email = TaskQueue::new(Arc::clone(&pool), QueueConfig::new("email")).unwrap();
    let reports = TaskQueue::new(Arc::clone(&pool), QueueConfig::new("reports")).unwrap();

    email.enqueue([Tag::custom("to", "ops")]).await.unwrap();
    reports.enqueue([]).await.unwrap();

    let task = email.retain().await.unwrap().unwrap();
    assert_eq!(task.namespace(), "email");
    assert_eq!(task.tag("to"), Some("ops"));
    assert!(email.retain().await.unwrap().is_none());
    assert!(reports.retain().await.unwrap().is_some());
    assert_eq!(pool.size(), 0);

    pool.close().await.unwrap();
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.idle(), 0);
}
