//! Throttler behaviour under concurrent callers.

use std::sync::Arc;
use std::time::Duration;

use crosswire::throttler::{AsyncThrottler, LinkedLimitWeightPair, RateLimit};

#[tokio::test(start_paused = true)]
async fn pool_capacity_gates_the_sixth_call() {
    let throttler = Arc::new(AsyncThrottler::new(vec![RateLimit::new("pool", 5, 1.0)]));

    let start = tokio::time::Instant::now();
    for _ in 0..5 {
        throttler.execute_task("pool").await;
    }
    // Five back-to-back calls complete promptly.
    assert_eq!(start.elapsed(), Duration::ZERO);

    throttler.execute_task("pool").await;
    // The sixth waits for the oldest entry to age out of the window.
    assert!(start.elapsed() >= Duration::from_secs_f64(0.99));
}

#[tokio::test(start_paused = true)]
async fn concurrent_tasks_share_a_linked_pool() {
    let throttler = Arc::new(AsyncThrottler::new(vec![
        RateLimit::new("pool", 4, 1.0),
        RateLimit::new("/depth", 100, 1.0).linked_to(vec![LinkedLimitWeightPair::new("pool")]),
        RateLimit::new("/ticker", 100, 1.0).linked_to(vec![LinkedLimitWeightPair::new("pool")]),
    ]));

    let start = tokio::time::Instant::now();
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let throttler = throttler.clone();
            tokio::spawn(async move {
                let limit_id = if i % 2 == 0 { "/depth" } else { "/ticker" };
                throttler.execute_task(limit_id).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Eight acquisitions through a pool of four need two windows.
    assert!(start.elapsed() >= Duration::from_secs_f64(0.99));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn waiters_make_progress_under_steady_load() {
    let throttler = Arc::new(AsyncThrottler::new(vec![RateLimit::new("pool", 2, 0.2)]));

    // Twenty acquisitions through a 2-per-200ms window all complete.
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let throttler = throttler.clone();
            tokio::spawn(async move {
                throttler.execute_task("pool").await;
            })
        })
        .collect();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("no waiter starved")
            .unwrap();
    }
}
