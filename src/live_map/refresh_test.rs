use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

const DEBOUNCE: Duration = Duration::from_millis(150);

fn counting_queue(work: Duration) -> (RefreshQueue, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let queue = RefreshQueue::spawn(DEBOUNCE, move || {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(work).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    (queue, runs)
}

#[tokio::test(start_paused = true)]
async fn burst_collapses_into_one_reload() {
    let (queue, runs) = counting_queue(Duration::ZERO);
    for _ in 0..10 {
        queue.request();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0, "still inside debounce window");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn request_during_reload_runs_one_trailing_reload() {
    let (queue, runs) = counting_queue(Duration::from_millis(500));
    queue.request();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0, "first reload in flight");

    assert!(queue.request());
    assert!(!queue.request(), "second request folds into the pending one");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_queue_stops_reloading() {
    let (queue, runs) = counting_queue(Duration::ZERO);
    let handle = queue.handle();
    drop(queue);
    handle.request();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}
