use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use synctools::{SyncResult, Waypoint};
use synctools_telemetry::tracing::init_test_tracing;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::common::TEST_TIMEOUT;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_survive_concurrent_resizing() {
    init_test_tracing();

    let waypoint = Waypoint::with_label("stress", 2);
    let token = CancellationToken::new();
    let max_capacity = 6;
    let peak = Arc::new(AtomicUsize::new(0));
    let current = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..64 {
        let waypoint = waypoint.clone();
        let token = token.clone();
        let peak = peak.clone();
        let current = current.clone();
        workers.spawn(async move {
            let worker = waypoint.wait(&token).await?;
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(1)).await;
            current.fetch_sub(1, Ordering::SeqCst);

            let id = worker.id();
            worker.done();
            SyncResult::Ok(id)
        });
    }

    let resizer = {
        let waypoint = waypoint.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let capacity = rand::thread_rng().gen_range(0..=max_capacity);
                waypoint.resize(capacity).unwrap();
                sleep(Duration::from_millis(1)).await;
            }
            // Leave the waypoint open so every remaining waiter gets through.
            waypoint.resize(max_capacity).unwrap();
        })
    };

    let mut ids = HashSet::new();
    timeout(TEST_TIMEOUT, async {
        while let Some(result) = workers.join_next().await {
            ids.insert(result.unwrap().unwrap());
        }
    })
    .await
    .expect("every waiter should eventually be admitted");
    resizer.await.unwrap();

    assert_eq!(ids.len(), 64);
    assert!(peak.load(Ordering::SeqCst) <= max_capacity);

    let metrics = waypoint.metrics();
    assert_eq!(metrics.finished, 64);
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.waiting, 0);

    let completion = waypoint.close();
    timeout(TEST_TIMEOUT, completion.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_waiters_do_not_block_admission() {
    init_test_tracing();

    let waypoint = Waypoint::new(1);
    let held = waypoint.wait(&CancellationToken::new()).await.unwrap();

    // Waiters on a token that is about to be cancelled.
    let doomed = CancellationToken::new();
    let mut cancelled = JoinSet::new();
    for _ in 0..4 {
        let waypoint = waypoint.clone();
        let token = doomed.clone();
        cancelled.spawn(async move { waypoint.wait(&token).await.map(|worker| worker.id()) });
    }

    let survivor = {
        let waypoint = waypoint.clone();
        tokio::spawn(async move {
            let worker = waypoint.wait(&CancellationToken::new()).await?;
            SyncResult::Ok(worker.id())
        })
    };

    timeout(TEST_TIMEOUT, async {
        while waypoint.metrics().waiting < 5 {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    doomed.cancel();
    held.done();

    timeout(TEST_TIMEOUT, survivor)
        .await
        .expect("the remaining waiter should be admitted")
        .unwrap()
        .unwrap();

    while let Some(result) = cancelled.join_next().await {
        // A waiter may have been admitted before observing the cancellation.
        if let Err(err) = result.unwrap() {
            assert!(err.is_cancelled());
        }
    }
}
