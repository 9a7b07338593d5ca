use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_queue::{ItemExponentialBackoff, WorkQueue};
use tokio::time::Instant;

fn queue(name: &'static str) -> Arc<WorkQueue<String>> {
    Arc::new(WorkQueue::with_rate_limiter(
        name,
        ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_is_never_processed_concurrently() {
    let q = queue("dedup");
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let passes = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = Arc::clone(&q);
        let in_flight = Arc::clone(&in_flight);
        let max_seen = Arc::clone(&max_seen);
        let passes = Arc::clone(&passes);
        workers.push(tokio::spawn(async move {
            while let Some(key) = q.get().await {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                passes.fetch_add(1, Ordering::SeqCst);
                q.done(&key);
            }
        }));
    }

    for _ in 0..50 {
        q.add("hot".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // Let the final dirty pass finish before closing.
    while !q.is_empty() || passes.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    for w in workers {
        w.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    let n = passes.load(Ordering::SeqCst);
    assert!(n >= 1 && n <= 50, "unexpected pass count {n}");
}

#[tokio::test(start_paused = true)]
async fn delayed_add_becomes_visible_after_delay() {
    let q = queue("delay");
    let start = Instant::now();
    q.add_after("k".to_string(), Duration::from_millis(50));
    assert!(q.is_empty());
    assert!(tokio::time::timeout(Duration::from_millis(10), q.get()).await.is_err());
    assert_eq!(q.get().await.as_deref(), Some("k"));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn plain_add_wins_over_pending_delay() {
    let q = queue("race");
    q.add_after("k".to_string(), Duration::from_secs(3600));
    q.add("k".to_string());
    let got = tokio::time::timeout(Duration::from_millis(1), q.get()).await;
    assert_eq!(got.unwrap().as_deref(), Some("k"));
}

#[tokio::test(start_paused = true)]
async fn earliest_delay_wins_and_stale_entry_is_skipped() {
    let q = queue("earliest");
    let start = Instant::now();
    q.add_after("k".to_string(), Duration::from_secs(1));
    q.add_after("k".to_string(), Duration::from_millis(10));
    let k = q.get().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    q.done(&k);

    // The superseded 1s entry must not deliver the key a second time.
    assert!(tokio::time::timeout(Duration::from_secs(2), q.get()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn parked_getter_wakes_for_delayed_key() {
    let q = queue("parked");
    let getter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::task::yield_now().await;
    q.add_after("k".to_string(), Duration::from_millis(20));
    assert_eq!(getter.await.unwrap().as_deref(), Some("k"));
}

#[tokio::test]
async fn shutdown_releases_blocked_getters() {
    let q = queue("shutdown");
    let getters: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    q.shut_down();
    for g in getters {
        assert_eq!(g.await.unwrap(), None);
    }
}
