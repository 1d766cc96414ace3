mod common;

use common::{ok, start, test_config, CallLog};
use github_scheduler::{Priority, SchedulerError};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn higher_priority_dispatches_first() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let low = s.submit(ok("low", &log).priority(Priority::Low)).unwrap();
    let high = s.submit(ok("high", &log).priority(Priority::High)).unwrap();
    let medium = s.submit(ok("medium", &log).priority(Priority::Medium)).unwrap();

    let (low, high, medium) = tokio::join!(low, high, medium);
    assert_eq!(low.unwrap().body, "low");
    assert_eq!(high.unwrap().body, "high");
    assert_eq!(medium.unwrap().body, "medium");
    assert_eq!(log.labels(), ["high", "medium", "low"]);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn same_tier_is_fifo() {
    let (s, clock) = start(test_config());
    let log = CallLog::default();
    let first = s.submit(ok("first", &log)).unwrap();
    clock.advance(Duration::from_secs(1));
    let second = s.submit(ok("second", &log)).unwrap();
    let third = s.submit(ok("third", &log)).unwrap();

    let (a, b, c) = tokio::join!(third, second, first);
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(log.labels(), ["first", "second", "third"]);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dispatches_are_spaced_by_min_interval() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let a = s.submit(ok("a", &log)).unwrap();
    let b = s.submit(ok("b", &log)).unwrap();
    let _ = tokio::join!(a, b);
    let times = log.times();
    assert!(times[1] - times[0] >= Duration::from_millis(100));
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_future_is_never_dispatched() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let abandoned = s.submit(ok("abandoned", &log).priority(Priority::High)).unwrap();
    let kept = s.submit(ok("kept", &log)).unwrap();
    drop(abandoned);

    assert!(kept.await.is_ok());
    assert_eq!(log.labels(), ["kept"]);
    assert_eq!(s.stats().cancelled, 1);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn caller_timeout_abandons_queued_request() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    // Budget nearly gone: the loop waits for reset before dispatching anything.
    let reset = common::anchor() + chrono::Duration::minutes(30);
    s.snapshots().update("core", 5000, 2, reset, None);
    let fut = s.submit(ok("slow", &log)).unwrap();

    let waited = tokio::time::timeout(Duration::from_secs(5), fut).await;
    assert!(waited.is_err());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(log.count(), 0);
    assert_eq!(s.stats().cancelled, 1);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_removes_queued_request() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let fut = s.submit(ok("x", &log)).unwrap();
    let id = fut.id();
    assert!(s.cancel(id));
    assert!(!s.cancel(id));
    assert_eq!(fut.await.unwrap_err(), SchedulerError::Cancelled);
    assert_eq!(log.count(), 0);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_pending_and_later_work() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let a = s.submit(ok("a", &log)).unwrap();
    let b = s.submit(ok("b", &log).priority(Priority::Low)).unwrap();
    s.shutdown().await;

    assert_eq!(a.await.unwrap_err(), SchedulerError::Cancelled);
    assert_eq!(b.await.unwrap_err(), SchedulerError::Cancelled);
    assert!(s.is_shut_down());
    assert_eq!(
        s.submit(ok("late", &log)).unwrap_err(),
        SchedulerError::Cancelled
    );
    assert_eq!(log.count(), 0);
    // Idempotent.
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_pacing_wait() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let reset = common::anchor() + chrono::Duration::minutes(45);
    s.snapshots().update("core", 5000, 1, reset, None);
    let fut = s.submit(ok("held", &log)).unwrap();
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    s.shutdown().await;
    assert_eq!(fut.await.unwrap_err(), SchedulerError::Cancelled);
    assert_eq!(log.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_timeout_is_rejected() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let err = s
        .submit(ok("x", &log).timeout(Duration::ZERO))
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
    assert_eq!(s.queue_depth().total, 0);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn queue_depth_counts_per_tier() {
    let (s, _) = start(test_config());
    let log = CallLog::default();
    let reset = common::anchor() + chrono::Duration::minutes(10);
    s.snapshots().update("core", 5000, 0, reset, None);
    let _a = s.submit(ok("a", &log).priority(Priority::High)).unwrap();
    let _b = s.submit(ok("b", &log).priority(Priority::Low)).unwrap();
    let _c = s.submit(ok("c", &log).priority(Priority::Low)).unwrap();

    let stats = s.stats();
    assert_eq!(stats.queue.total, 3);
    assert_eq!(stats.queue.high, 1);
    assert_eq!(stats.queue.medium, 0);
    assert_eq!(stats.queue.low, 2);
    s.shutdown().await;
}
