//! Worker scheduling tests: concurrency cap, queue draining, expiry, and
//! recovery from store failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tasq_rs::envelope::RequestEnvelope;
use tasq_rs::id::RequestId;
use tasq_rs::model;
use tasq_rs::store::{Fault, MemoryStore, Store, Transaction};
use tasq_rs::worker::{Handler, Handlers, ServeOptions, Worker};
use tasq_rs::{Caller, CallerOptions, RequestOptions};
use tokio::sync::mpsc;
use tokio::time::Instant;

async fn connect(store: &MemoryStore) -> Caller {
    Caller::connect(Arc::new(store.clone()), CallerOptions::default())
        .await
        .unwrap()
}

/// Handlers whose `work` method sleeps `ms` and counts how many run at once.
fn tracked(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>, ms: u64) -> Handlers {
    Handlers::new().method("work", move |args| {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(args.unwrap_or(Value::Null))
        }
    })
}

fn counting(calls: Arc<AtomicUsize>) -> Handlers {
    Handlers::new().sync_method("ping", move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!("pong"))
    })
}

async fn push_raw(store: &MemoryStore, topic: &str, payload: Vec<u8>) {
    store
        .exec(Transaction::new().rpush(model::queue_key(topic), payload))
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn third_task_waits_for_a_free_slot() {
    let store = MemoryStore::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let _worker = Worker::start(
        Arc::new(store.clone()),
        "jobs",
        ServeOptions::new(tracked(running, Arc::clone(&peak), 100)).concurrency(2),
    )
    .await
    .unwrap();
    let caller = connect(&store).await;

    let started = Instant::now();
    let timed = |n: i64| {
        let caller = caller.clone();
        async move {
            let result = caller
                .request("jobs", "work", Some(json!(n)), RequestOptions::default())
                .await;
            (result, started.elapsed())
        }
    };
    let (a, b, c) = tokio::join!(timed(1), timed(2), timed(3));

    let mut elapsed = Vec::new();
    for (n, (result, took)) in [a, b, c].into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(n as i64 + 1));
        elapsed.push(took);
    }
    elapsed.sort();

    assert!(elapsed[0] >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed[1] < Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed[2] >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed[2] < Duration::from_millis(300), "{elapsed:?}");
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn active_tasks_never_exceed_the_cap() {
    let store = MemoryStore::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let worker = Worker::start(
        Arc::new(store.clone()),
        "jobs",
        ServeOptions::new(tracked(Arc::clone(&running), Arc::clone(&peak), 10)).concurrency(3),
    )
    .await
    .unwrap();
    let caller = connect(&store).await;

    let requests = (0..20).map(|n| {
        let caller = caller.clone();
        async move {
            caller
                .request("jobs", "work", Some(json!(n)), RequestOptions::default())
                .await
        }
    });
    let results = futures::future::join_all(requests).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(n));
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(running.load(Ordering::SeqCst), 0);
    assert!(store.is_empty("@tasq:jobs"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = worker.state();
    assert_eq!(state.active, 0);
    assert!(!state.pending_wakeup);
}

#[tokio::test(start_paused = true)]
async fn single_slot_worker_runs_tasks_in_queue_order() {
    let store = MemoryStore::new();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let handlers = Handlers::new().sync_method("record", move |args| {
        seen.lock().push(args.unwrap_or(Value::Null));
        Ok(Value::Null)
    });
    let _worker = Worker::start(Arc::new(store.clone()), "fifo", ServeOptions::new(handlers))
        .await
        .unwrap();
    let caller = connect(&store).await;

    // Submitted together, picked up one at a time in push order.
    let requests = (0..5).map(|n| {
        let caller = caller.clone();
        async move {
            caller
                .request("fifo", "record", Some(json!(n)), RequestOptions::default())
                .await
        }
    });
    for result in futures::future::join_all(requests).await {
        result.unwrap();
    }
    assert_eq!(*order.lock(), (0..5).map(|n| json!(n)).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Queue draining
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn tasks_queued_before_the_worker_starts_are_drained() {
    let store = MemoryStore::new();
    let caller = connect(&store).await;

    let waiting: Vec<_> = (0..3)
        .map(|_| {
            let caller = caller.clone();
            tokio::spawn(async move {
                caller
                    .request("late", "ping", None, RequestOptions::default())
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.len("@tasq:late"), 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let _worker = Worker::start(
        Arc::new(store.clone()),
        "late",
        ServeOptions::new(counting(Arc::clone(&calls))),
    )
    .await
    .unwrap();

    for handle in waiting {
        assert_eq!(handle.await.unwrap().unwrap(), json!("pong"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(store.is_empty("@tasq:late"));
}

#[tokio::test]
async fn expired_tasks_are_skipped() {
    let store = MemoryStore::new();
    let mut ghost = store.subscribe(&model::response_channel("ghost")).await.unwrap();

    let expired = RequestEnvelope {
        caller_id: "ghost".to_string(),
        request_id: RequestId::generate(),
        expires_at: model::now_ms() - 1,
        method: "ping".to_string(),
        args: None,
    };
    push_raw(&store, "exp", expired.encode().unwrap()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let _worker = Worker::start(
        Arc::new(store.clone()),
        "exp",
        ServeOptions::new(counting(Arc::clone(&calls))),
    )
    .await
    .unwrap();
    let caller = connect(&store).await;

    let result = caller
        .request("exp", "ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Nothing was ever published for the expired request.
    let silence = tokio::time::timeout(Duration::from_millis(50), ghost.recv()).await;
    assert!(silence.is_err());
}

#[tokio::test]
async fn malformed_tasks_are_skipped() {
    let store = MemoryStore::new();
    push_raw(&store, "junk", b"definitely not msgpack".to_vec()).await;
    push_raw(&store, "junk", rmp_serde::to_vec(&("too", "short")).unwrap()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let _worker = Worker::start(
        Arc::new(store.clone()),
        "junk",
        ServeOptions::new(counting(Arc::clone(&calls))),
    )
    .await
    .unwrap();
    let caller = connect(&store).await;

    let result = caller
        .request("junk", "ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.is_empty("@tasq:junk"));
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop_failure_is_reported_and_the_next_notification_recovers() {
    let store = MemoryStore::new();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    store.set_fault(Fault::Pop, true);

    let worker = Worker::start(
        Arc::new(store.clone()),
        "flaky",
        ServeOptions::new(counting(Arc::new(AtomicUsize::new(0))))
            .on_error(move |e| {
                let _ = errors_tx.send(e.to_string());
            }),
    )
    .await
    .unwrap();

    // The startup cycle hits the fault.
    let reported = errors.recv().await.unwrap();
    assert!(reported.contains("Pop"), "{reported}");
    assert_eq!(worker.state().active, 0);

    store.set_fault(Fault::Pop, false);
    let caller = connect(&store).await;
    let result = caller
        .request("flaky", "ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn publish_failure_is_reported_and_the_caller_times_out() {
    let store = MemoryStore::new();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    let calls = Arc::new(AtomicUsize::new(0));

    let _worker = Worker::start(
        Arc::new(store.clone()),
        "mute",
        ServeOptions::new(counting(Arc::clone(&calls))).on_error(move |e| {
            let _ = errors_tx.send(e.to_string());
        }),
    )
    .await
    .unwrap();
    let caller = connect(&store).await;

    store.set_fault(Fault::Publish, true);
    let err = caller
        .request("mute", "ping", None, RequestOptions::timeout_ms(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(errors.recv().await.unwrap().contains("Publish"));

    store.set_fault(Fault::Publish, false);
    let result = caller
        .request("mute", "ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn destroyed_worker_leaves_new_tasks_queued() {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Worker::start(
        Arc::new(store.clone()),
        "gone",
        ServeOptions::new(counting(Arc::clone(&calls))),
    )
    .await
    .unwrap();
    assert_eq!(worker.topic(), "gone");
    assert_eq!(worker.concurrency(), 1);

    worker.destroy().await;
    worker.destroy().await;
    assert!(worker.is_destroyed());
    assert_eq!(store.subscriber_count("@tasq:s:gone"), 0);

    let caller = connect(&store).await;
    let err = caller
        .request("gone", "ping", None, RequestOptions::timeout_ms(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn separate_subscriber_store_carries_notifications() {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let _worker = Worker::start(
        Arc::new(store.clone()),
        "split",
        ServeOptions::new(counting(Arc::clone(&calls))).subscriber(Arc::new(store.clone())),
    )
    .await
    .unwrap();
    assert_eq!(store.subscriber_count("@tasq:s:split"), 1);

    let caller = connect(&store).await;
    let result = caller
        .request("split", "ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn worker_rejects_bad_options() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    assert!(
        Worker::start(Arc::clone(&store), "", ServeOptions::default())
            .await
            .is_err()
    );
    assert!(
        Worker::start(store, "t", ServeOptions::default().concurrency(0))
            .await
            .is_err()
    );
}

// ---------------------------------------------------------------------------
// Method table
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exact_match_beats_fallback() {
    let handlers = Handlers::new()
        .sync_method("a", |_| Ok(json!("exact")))
        .fallback(|method, _| async move { Ok(json!(method)) });
    assert_eq!(handlers.len(), 1);
    assert!(handlers.has_fallback());

    let exact = handlers.resolve("a").unwrap();
    assert!(matches!(exact, Handler::Method(_)));
    assert_eq!(exact.call("a", None).await.unwrap(), json!("exact"));

    let routed = handlers.resolve("b").unwrap();
    assert!(matches!(routed, Handler::Fallback(_)));
    assert_eq!(routed.call("b", None).await.unwrap(), json!("b"));
}

#[test]
fn missing_method_without_fallback_resolves_to_nothing() {
    let handlers = Handlers::new().sync_method("a", |_| Ok(Value::Null));
    assert!(handlers.resolve("b").is_none());
    assert!(!handlers.has_fallback());
    assert!(Handlers::new().is_empty());
}
