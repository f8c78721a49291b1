//! Integration tests for queueing, concurrency, retry, and lifecycle
//!
//! All tests run on a paused clock so sleeps resolve instantly.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ratelimiter::{
    LimiterEvent, RateLimitError, RateLimiter, RateLimiterConfig, RetryClassifier, RetryConfig, ScheduleOptions,
    WorkError,
};

// =============================================================================
// Helpers
// =============================================================================

fn collect_events(limiter: &RateLimiter) -> Arc<Mutex<Vec<LimiterEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    limiter.on(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    events
}

fn count_type(events: &Arc<Mutex<Vec<LimiterEvent>>>, event_type: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type() == event_type)
        .count()
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay_ms: 10,
        max_delay_ms: 100,
        ..Default::default()
    }
}

fn priority(p: i32) -> ScheduleOptions {
    ScheduleOptions::default().with_priority(p)
}

// =============================================================================
// Ordering and concurrency
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_higher_priority_runs_first() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("order"));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (name, p) in [("A", 0), ("B", 5), ("C", 1), ("D", 5)] {
        let order = Arc::clone(&order);
        let handle = limiter
            .submit(
                move || {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(name);
                        Ok(name)
                    }
                },
                priority(p),
            )
            .unwrap();
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }

    // Priority descending, FIFO within a tier
    assert_eq!(*order.lock().unwrap(), vec!["B", "D", "C", "A"]);
}

#[tokio::test(start_paused = true)]
async fn test_queued_ids_follow_admission_order() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("ids"));
    let low = limiter.submit(|| async { Ok(()) }, priority(1)).unwrap();
    let high = limiter.submit(|| async { Ok(()) }, priority(9)).unwrap();

    assert_eq!(limiter.queued_ids(), vec![high.id().to_string(), low.id().to_string()]);

    high.await.unwrap();
    low.await.unwrap();
    assert!(limiter.queued_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_cap() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("concurrency").with_max_concurrent(2));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let handle = limiter
            .submit(
                move || {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                ScheduleOptions::default(),
            )
            .unwrap();
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let stats = limiter.stats();
    assert_eq!(stats.peak_concurrent, 2);
    assert_eq!(stats.total_processed, 6);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queue_size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_three_requests_with_concurrency_two() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("abc").with_max_concurrent(2));
    let events = collect_events(&limiter);

    let a = limiter
        .submit(
            || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok("A")
            },
            priority(0),
        )
        .unwrap();
    let b = limiter
        .submit(
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("B")
            },
            priority(0),
        )
        .unwrap();
    let c = limiter.submit(|| async { Ok("C") }, priority(0)).unwrap();
    let (a_id, b_id, c_id) = (a.id().to_string(), b.id().to_string(), c.id().to_string());

    assert_eq!(a.await.unwrap().value, "A");
    assert_eq!(b.await.unwrap().value, "B");
    assert_eq!(c.await.unwrap().value, "C");

    let stats = limiter.stats();
    assert_eq!(stats.total_processed, 3);
    assert_eq!(stats.total_rejected, 0);
    assert_eq!(stats.peak_concurrent, 2);

    // A and B start together; C waits for a free slot
    let log: Vec<(&'static str, String)> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e.event_type(), "request:started" | "request:completed"))
        .map(|e| (e.event_type(), e.request_id().unwrap_or_default().to_string()))
        .collect();
    let position = |kind: &str, id: &str| {
        log.iter()
            .position(|(k, i)| *k == kind && i == id)
            .unwrap_or_else(|| panic!("missing {} for {}", kind, id))
    };
    let first_completed = log
        .iter()
        .position(|(k, _)| *k == "request:completed")
        .expect("no completion");

    assert!(position("request:started", &a_id) < first_completed);
    assert!(position("request:started", &b_id) < first_completed);
    assert!(position("request:started", &c_id) > first_completed);
    assert_eq!(log[first_completed].1, a_id);
}

// =============================================================================
// Admission errors
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_full_rejects_immediately() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("bounded").with_max_queue_size(2));
    let first = limiter.submit(|| async { Ok(1) }, ScheduleOptions::default()).unwrap();
    let second = limiter.submit(|| async { Ok(2) }, ScheduleOptions::default()).unwrap();

    let err = limiter
        .submit(|| async { Ok(3) }, ScheduleOptions::default())
        .unwrap_err();
    assert!(matches!(err, RateLimitError::QueueFull { max: 2 }));
    assert!(err.is_admission_error());
    assert_eq!(limiter.stats().total_rejected, 1);

    assert_eq!(first.await.unwrap().value, 1);
    assert_eq!(second.await.unwrap().value, 2);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expires_while_queued() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("deadline"));
    let events = collect_events(&limiter);

    let slow = limiter
        .submit(
            || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            ScheduleOptions::default(),
        )
        .unwrap();
    let impatient = limiter
        .submit(
            || async { Ok(()) },
            ScheduleOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    let impatient_id = impatient.id().to_string();

    slow.await.unwrap();
    let err = impatient.await.unwrap_err();
    assert!(matches!(err, RateLimitError::Expired { ref id } if *id == impatient_id));

    let stats = limiter.stats();
    assert_eq!(stats.total_expired, 1);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(count_type(&events, "request:expired"), 1);
    // The expired request never started
    assert_eq!(count_type(&events, "request:started"), 1);
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_makes_max_retries_plus_one_attempts() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("retry").with_retry(fast_retry(3)));
    let events = collect_events(&limiter);
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let err = limiter
        .schedule(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(WorkError::status(503, "service unavailable"))
                }
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let work = err.work_error().expect("work error");
    assert_eq!(work.status_code(), Some(503));

    assert_eq!(count_type(&events, "request:requeued"), 3);
    let failed = events
        .lock()
        .unwrap()
        .iter()
        .find_map(|e| match e {
            LimiterEvent::RequestFailed { attempts, .. } => Some(*attempts),
            _ => None,
        });
    assert_eq!(failed, Some(4));

    let stats = limiter.stats();
    assert_eq!(stats.total_retries, 3);
    assert_eq!(stats.total_rejected, 1);
    assert_eq!(stats.total_processed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("flaky").with_retry(fast_retry(3)));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let result = limiter
        .schedule(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(WorkError::new("Timeout", "upstream timed out"))
                    } else {
                        Ok("done")
                    }
                }
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.value, "done");
    assert_eq!(result.retries, 2);
    assert_eq!(limiter.stats().total_processed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_fails_on_first_attempt() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("fatal").with_retry(fast_retry(5)));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    let err = limiter
        .schedule(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(WorkError::status(400, "bad request"))
                }
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(err.work_error().and_then(|w| w.status_code()), Some(400));
    assert_eq!(limiter.stats().total_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_custom_classifier_overrides_default() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("custom").with_retry(fast_retry(2)));
    let attempts = Arc::new(AtomicU32::new(0));

    // 503 is retryable by default; this classifier refuses everything
    let counter = Arc::clone(&attempts);
    let options = ScheduleOptions::default().with_classifier(RetryClassifier::custom(|_| false));
    let result = limiter
        .schedule(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(WorkError::status(503, "unavailable"))
                }
            },
            options,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_work_is_contained() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("panic").with_retry(fast_retry(3)));

    let err = limiter
        .schedule(
            || async {
                if true {
                    panic!("boom");
                }
                Ok(())
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap_err();
    let work = err.work_error().expect("work error");
    assert_eq!(work.category(), "Panic");
    assert_eq!(work.message(), "boom");
    assert_eq!(limiter.stats().total_retries, 0);

    // The limiter keeps draining after a panic
    let ok = limiter.schedule(|| async { Ok(7) }, ScheduleOptions::default()).await;
    assert_eq!(ok.unwrap().value, 7);
    assert_eq!(limiter.stats().active, 0);
}

// =============================================================================
// Cancel and destroy
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_request() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("cancel"));
    let keep = limiter.submit(|| async { Ok(1) }, ScheduleOptions::default()).unwrap();
    let drop_me = limiter.submit(|| async { Ok(2) }, ScheduleOptions::default()).unwrap();
    let id = drop_me.id().to_string();

    assert!(limiter.cancel(&id));
    assert!(!limiter.cancel(&id));
    assert!(!limiter.cancel("no-such-request"));

    assert!(matches!(drop_me.await, Err(RateLimitError::Cancelled { .. })));
    assert_eq!(keep.await.unwrap().value, 1);

    let stats = limiter.stats();
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_rejects_queued_and_lets_in_flight_finish() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("destroy"));

    let running = limiter
        .submit(
            || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("finished")
            },
            ScheduleOptions::default(),
        )
        .unwrap();
    let queued_a = limiter.submit(|| async { Ok("a") }, ScheduleOptions::default()).unwrap();
    let queued_b = limiter.submit(|| async { Ok("b") }, ScheduleOptions::default()).unwrap();

    // Let the first request start
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(limiter.stats().active, 1);

    limiter.destroy().await;
    assert!(limiter.is_destroyed());

    assert!(matches!(queued_a.await, Err(RateLimitError::Destroyed)));
    assert!(matches!(queued_b.await, Err(RateLimitError::Destroyed)));
    assert_eq!(running.await.unwrap().value, "finished");

    let err = limiter
        .schedule(|| async { Ok(()) }, ScheduleOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::Destroyed));

    // Idempotent
    limiter.destroy().await;

    let stats = limiter.stats();
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_rejected, 3);
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failing_listeners_are_isolated() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("listeners"));
    limiter.on(|_| Err(eyre::eyre!("listener failed")));
    limiter.on(|_| panic!("listener panicked"));
    let events = collect_events(&limiter);

    let result = limiter.schedule(|| async { Ok(42) }, ScheduleOptions::default()).await;
    assert_eq!(result.unwrap().value, 42);

    let types: Vec<_> = events.lock().unwrap().iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["request:queued", "request:started", "request:completed"]);
}

#[tokio::test(start_paused = true)]
async fn test_off_removes_listener() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("off"));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let subscription = limiter.on(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    limiter.schedule(|| async { Ok(()) }, ScheduleOptions::default()).await.unwrap();
    let after_first = seen.load(Ordering::SeqCst);
    assert_eq!(after_first, 3);

    assert!(limiter.off(subscription.id()));
    limiter.schedule(|| async { Ok(()) }, ScheduleOptions::default()).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), after_first);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_subscriber_sees_metadata() {
    let limiter = RateLimiter::new(RateLimiterConfig::new("broadcast"));
    let mut rx = limiter.subscribe();

    limiter
        .schedule(
            || async { Ok(()) },
            ScheduleOptions::default().with_metadata("endpoint", "/repos"),
        )
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        LimiterEvent::RequestQueued {
            limiter_id, metadata, ..
        } => {
            assert_eq!(limiter_id, "broadcast");
            assert_eq!(metadata.get("endpoint"), Some(&serde_json::json!("/repos")));
        }
        other => panic!("Expected request:queued, got {:?}", other),
    }
}
