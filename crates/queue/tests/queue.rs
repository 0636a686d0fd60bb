#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tender_core::ObjectKey;
use tender_queue::{Backoff, WorkQueue, MAX_DELAY};

fn key(name: &str) -> ObjectKey { ObjectKey::new("default", name) }

async fn get_now(q: &WorkQueue<ObjectKey>) -> Option<ObjectKey> {
    tokio::time::timeout(Duration::from_millis(10), q.get()).await.ok().flatten()
}

#[tokio::test(start_paused = true)]
async fn burst_of_adds_coalesces_into_one_entry() {
    let q = WorkQueue::default();
    for _ in 0..10 { q.add(key("a")); }
    q.add(key("b"));
    assert_eq!(q.len(), 2);
    assert_eq!(get_now(&q).await, Some(key("a")));
    assert_eq!(get_now(&q).await, Some(key("b")));
    assert_eq!(get_now(&q).await, None);
}

#[tokio::test(start_paused = true)]
async fn adds_during_processing_are_held_until_done() {
    let q = WorkQueue::default();
    q.add(key("a"));
    let k = get_now(&q).await.expect("ready");

    // Rapid-fire events while the key is in flight
    for _ in 0..25 { q.add(key("a")); }
    assert_eq!(q.len(), 0, "in-flight key must not be handed to a second worker");
    assert_eq!(get_now(&q).await, None);

    q.done(&k);
    assert_eq!(q.len(), 1);
    assert_eq!(get_now(&q).await, Some(key("a")));
    q.done(&key("a"));
    assert_eq!(get_now(&q).await, None);
}

#[tokio::test(start_paused = true)]
async fn done_without_new_adds_leaves_queue_empty() {
    let q = WorkQueue::default();
    q.add(key("a"));
    let k = get_now(&q).await.expect("ready");
    q.done(&k);
    assert!(q.is_empty());
}

#[tokio::test(start_paused = true)]
async fn delayed_add_is_invisible_until_due() {
    let q = WorkQueue::default();
    let start = tokio::time::Instant::now();
    q.add_after(key("a"), Duration::from_secs(60));
    assert_eq!(q.delayed(), 1);
    assert!(tokio::time::timeout(Duration::from_secs(30), q.get()).await.is_err());

    let got = q.get().await;
    assert_eq!(got, Some(key("a")));
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert_eq!(q.delayed(), 0);
}

#[tokio::test(start_paused = true)]
async fn unbounded_delays_are_clamped_and_direct_adds_still_win() {
    let q = WorkQueue::new(Backoff::new(Duration::MAX, Duration::MAX));
    let start = tokio::time::Instant::now();
    q.add_after(key("a"), Duration::MAX);
    q.add_rate_limited(key("b"));
    assert_eq!(q.delayed(), 2);

    q.add(key("a"));
    assert_eq!(get_now(&q).await, Some(key("a")));
    q.done(&key("a"));

    // Both parked entries come due together after the clamp
    let mut due = Vec::new();
    for _ in 0..2 {
        let k = q.get().await.expect("due");
        q.done(&k);
        due.push(k);
    }
    due.sort();
    assert_eq!(due, vec![key("a"), key("b")]);
    assert!(start.elapsed() >= MAX_DELAY);
}

#[tokio::test(start_paused = true)]
async fn earlier_delay_wins_for_same_key() {
    let q = WorkQueue::default();
    let start = tokio::time::Instant::now();
    q.add_after(key("a"), Duration::from_secs(60));
    q.add_after(key("a"), Duration::from_secs(5));
    assert_eq!(q.delayed(), 1);
    assert_eq!(q.get().await, Some(key("a")));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(60), "waited {:?}", waited);
}

#[tokio::test(start_paused = true)]
async fn waiting_worker_picks_up_later_delayed_add() {
    let q = Arc::new(WorkQueue::default());
    let worker = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::task::yield_now().await;
    q.add_after(key("late"), Duration::from_secs(3));
    let got = tokio::time::timeout(Duration::from_secs(10), worker).await.expect("worker woke").expect("join");
    assert_eq!(got, Some(key("late")));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_requeue_backs_off_and_forget_resets() {
    let q = WorkQueue::new(Backoff::new(Duration::from_secs(1), Duration::from_secs(4)));
    let k = key("flaky");

    let mut delays = Vec::new();
    for _ in 0..4 {
        let start = tokio::time::Instant::now();
        q.add_rate_limited(k.clone());
        let got = q.get().await.expect("requeued");
        delays.push(start.elapsed().as_secs());
        q.done(&got);
    }
    assert_eq!(delays, vec![1, 2, 4, 4]);
    assert_eq!(q.num_requeues(&k), 4);

    q.forget(&k);
    assert_eq!(q.num_requeues(&k), 0);
    let start = tokio::time::Instant::now();
    q.add_rate_limited(k.clone());
    q.get().await.expect("requeued");
    assert_eq!(start.elapsed().as_secs(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_wakes_waiting_workers() {
    let q = Arc::new(WorkQueue::<ObjectKey>::default());
    let worker = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::task::yield_now().await;
    q.shut_down();
    let got = tokio::time::timeout(Duration::from_secs(1), worker).await.expect("worker exited").expect("join");
    assert_eq!(got, None);
    q.add(key("ignored"));
    assert!(q.is_empty());
    assert!(q.is_shutting_down());
}
