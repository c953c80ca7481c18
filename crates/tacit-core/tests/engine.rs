//! Dispatcher behavior: ordering, retries, backoff, manual stop, events.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    Reply, ScriptedTransport, engine, engine_with, operation_keys, recorder, wait_drained,
    wait_empty, wait_until,
};
use serde_json::json;
use tacit_core::domain::{CompleteOutcome, FailEvent, RetryEvent};
use tacit_core::impls::InMemoryStore;
use tacit_core::{
    Backoff, OperationStatus, QueueError, RequestDescriptor, RequestError, RetryClassifier,
    RetryPolicy, SilentConfig,
};

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Backoff::new(Duration::from_millis(300), 1.5))
}

#[tokio::test(start_paused = true)]
async fn operations_in_one_queue_run_strictly_in_order() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::ok();
    let queue = engine(&store, &transport);

    let log = recorder::<String>();
    let before = log.clone();
    let _s1 = queue.on_before_dispatch(move |e| {
        before
            .lock()
            .unwrap()
            .push(format!("start {}", e.operation.request.target))
    });
    let complete = log.clone();
    let _s2 = queue.on_complete(move |e| {
        complete
            .lock()
            .unwrap()
            .push(format!("done {:?}", e.outcome))
    });

    for target in ["/a", "/b", "/c"] {
        let op = queue.new_operation(RequestDescriptor::post(target));
        queue.enqueue(op).await.unwrap();
    }
    queue.boot().await.unwrap();
    wait_until(|| log.lock().unwrap().len() == 6).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "start /a",
            "done Succeeded",
            "start /b",
            "done Succeeded",
            "start /c",
            "done Succeeded",
        ]
    );
    assert_eq!(transport.sent_targets(), vec!["/a", "/b", "/c"]);
    assert!(queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn a_failing_queue_does_not_block_another_queue() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(|request| {
        if request.target.starts_with("/slow") {
            Reply::Err(RequestError::network("offline"))
        } else {
            Reply::Ok(json!({}))
        }
    });
    let queue = engine(&store, &transport);
    queue.boot().await.unwrap();

    let slow = queue
        .new_operation(RequestDescriptor::post("/slow"))
        .in_queue("slow")
        .with_retry(RetryPolicy::new(5, Backoff::new(Duration::from_secs(60), 1.0)));
    queue.enqueue(slow).await.unwrap();
    let fast = queue
        .new_operation(RequestDescriptor::post("/fast"))
        .in_queue("fast");
    queue.enqueue(fast).await.unwrap();

    wait_drained(&queue, "fast").await;
    assert_eq!(queue.snapshot("slow").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_once_and_leave_nothing_behind() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::offline();
    let queue = engine(&store, &transport);

    let retries = recorder::<RetryEvent>();
    let fails = recorder::<FailEvent>();
    let r = retries.clone();
    let _s1 = queue.on_retry(move |e| r.lock().unwrap().push(e.clone()));
    let f = fails.clone();
    let _s2 = queue.on_fail(move |e| f.lock().unwrap().push(e.clone()));

    let op = queue
        .new_operation(RequestDescriptor::post("/todos"))
        .durable(true)
        .with_retry(policy(3));
    let id = queue.enqueue(op).await.unwrap();
    queue.boot().await.unwrap();

    wait_until(|| !fails.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.send_count(), 4);
    let retries = retries.lock().unwrap();
    assert_eq!(
        retries.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    let fails = fails.lock().unwrap();
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].attempt, 3);
    assert_eq!(fails[0].operation.id, id);
    assert!(matches!(
        fails[0].error,
        QueueError::Terminal { attempt: 3, .. }
    ));

    assert!(queue.is_empty().await);
    assert!(operation_keys(&store).is_empty());
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_by_the_multiplier() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::offline();
    let queue = engine(&store, &transport);

    let retries = recorder::<RetryEvent>();
    let r = retries.clone();
    let _s = queue.on_retry(move |e| r.lock().unwrap().push(e.clone()));

    let op = queue
        .new_operation(RequestDescriptor::post("/todos"))
        .with_retry(policy(2));
    queue.enqueue(op).await.unwrap();
    queue.boot().await.unwrap();

    wait_until(|| transport.send_count() == 3).await;

    let delays: Vec<Duration> = retries.lock().unwrap().iter().map(|e| e.delay).collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(300), Duration::from_millis(450)]
    );
    let times = transport.send_times();
    assert!(times[1] - times[0] >= Duration::from_millis(300));
    assert!(times[2] - times[1] >= Duration::from_millis(450));
}

#[tokio::test(start_paused = true)]
async fn an_explicit_zero_jitter_ignores_the_engine_jitter() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::offline();
    let config = SilentConfig {
        jitter: 0.5,
        ..SilentConfig::default()
    };
    let queue = engine_with(&store, &transport, config);

    let retries = recorder::<RetryEvent>();
    let r = retries.clone();
    let _s = queue.on_retry(move |e| r.lock().unwrap().push(e.clone()));

    let exact = queue
        .new_operation(RequestDescriptor::post("/exact"))
        .in_queue("exact")
        .with_retry(RetryPolicy::new(
            2,
            Backoff::new(Duration::from_millis(300), 1.5).with_jitter(0.0),
        ));
    let jittered = queue
        .new_operation(RequestDescriptor::post("/jittered"))
        .in_queue("jittered")
        .with_retry(RetryPolicy::new(1, Backoff::new(Duration::from_millis(300), 1.5)));
    queue.enqueue(exact).await.unwrap();
    queue.enqueue(jittered).await.unwrap();
    queue.boot().await.unwrap();
    wait_empty(&queue).await;

    let retries = retries.lock().unwrap();
    let delays_for = |target: &str| -> Vec<Duration> {
        retries
            .iter()
            .filter(|e| e.operation.request.target == target)
            .map(|e| e.delay)
            .collect()
    };
    assert_eq!(
        delays_for("/exact"),
        vec![Duration::from_millis(300), Duration::from_millis(450)]
    );
    let jittered = delays_for("/jittered");
    assert_eq!(jittered.len(), 1);
    assert!(jittered[0] >= Duration::from_millis(150) && jittered[0] <= Duration::from_millis(450));
    assert_ne!(jittered[0], Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_errors_are_not_retried() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(|_| Reply::Err(RequestError::from_status(422, "bad")));
    let queue = engine(&store, &transport);

    let fails = recorder::<FailEvent>();
    let f = fails.clone();
    let _s = queue.on_fail(move |e| f.lock().unwrap().push(e.clone()));

    let classifier = RetryClassifier::Categories {
        categories: vec![tacit_core::ErrorCategory::Network],
    };
    let op = queue
        .new_operation(RequestDescriptor::post("/todos"))
        .with_retry(policy(3).with_classifier(classifier));
    queue.enqueue(op).await.unwrap();
    queue.boot().await.unwrap();

    wait_until(|| fails.lock().unwrap().len() == 1).await;
    assert_eq!(transport.send_count(), 1);
    assert_eq!(fails.lock().unwrap()[0].attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_while_waiting_for_retry_fails_once_with_manual_stop() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::offline();
    let queue = engine(&store, &transport);

    let retries = recorder::<RetryEvent>();
    let fails = recorder::<FailEvent>();
    let outcomes = recorder::<CompleteOutcome>();
    let r = retries.clone();
    let _s1 = queue.on_retry(move |e| r.lock().unwrap().push(e.clone()));
    let f = fails.clone();
    let _s2 = queue.on_fail(move |e| f.lock().unwrap().push(e.clone()));
    let o = outcomes.clone();
    let _s3 = queue.on_complete(move |e| o.lock().unwrap().push(e.outcome));

    let op = queue
        .new_operation(RequestDescriptor::post("/todos"))
        .durable(true)
        .with_retry(RetryPolicy::new(5, Backoff::new(Duration::from_secs(10), 1.0)));
    let id = queue.enqueue(op).await.unwrap();
    queue.boot().await.unwrap();

    wait_until(|| retries.lock().unwrap().len() == 1).await;
    queue.stop(id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.send_count(), 1);
    assert_eq!(retries.lock().unwrap().len(), 1);
    let fails = fails.lock().unwrap();
    assert_eq!(fails.len(), 1);
    assert!(fails[0].is_manual_stop());
    assert_eq!(fails[0].operation.status, OperationStatus::Stopped);
    assert_eq!(fails[0].operation.last_error.as_deref(), Some("network error: offline"));
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![CompleteOutcome::RetryScheduled, CompleteOutcome::Failed]
    );
    assert!(queue.is_empty().await);
    assert!(operation_keys(&store).is_empty());

    let again = queue.stop(id).await;
    assert!(matches!(again, Err(QueueError::InvalidState(_))));
}

#[tokio::test(start_paused = true)]
async fn stop_abandons_a_hanging_request_and_the_queue_moves_on() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(|request| match request.target.as_str() {
        "/hang" => Reply::Hang,
        _ => Reply::Ok(json!({})),
    });
    let queue = engine(&store, &transport);
    queue.boot().await.unwrap();

    let fails = recorder::<FailEvent>();
    let f = fails.clone();
    let _s = queue.on_fail(move |e| f.lock().unwrap().push(e.clone()));

    let hanging = queue.new_operation(RequestDescriptor::post("/hang"));
    let hanging_id = queue.enqueue(hanging).await.unwrap();
    let next = queue.new_operation(RequestDescriptor::post("/next"));
    queue.enqueue(next).await.unwrap();

    wait_until(|| transport.send_count() == 1).await;
    queue.stop(hanging_id).await.unwrap();

    wait_empty(&queue).await;
    assert_eq!(transport.sent_targets(), vec!["/hang", "/next"]);
    assert_eq!(fails.lock().unwrap().len(), 1);
    assert!(fails.lock().unwrap()[0].is_manual_stop());
}

#[tokio::test]
async fn stop_without_an_attempt_in_flight_is_invalid() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::ok();
    let queue = engine(&store, &transport);

    let op = queue.new_operation(RequestDescriptor::post("/todos"));
    let id = queue.enqueue(op).await.unwrap();

    let result = queue.stop(id).await;
    assert!(matches!(result, Err(QueueError::InvalidState(_))));
    assert_eq!(queue.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn removing_a_waiting_operation_silences_it() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::offline();
    let queue = engine(&store, &transport);

    let fails = recorder::<FailEvent>();
    let f = fails.clone();
    let _s = queue.on_fail(move |e| f.lock().unwrap().push(e.clone()));

    let op = queue
        .new_operation(RequestDescriptor::post("/todos"))
        .durable(true)
        .with_retry(RetryPolicy::new(5, Backoff::new(Duration::from_secs(10), 1.0)));
    let id = queue.enqueue(op).await.unwrap();
    queue.boot().await.unwrap();
    wait_until(|| transport.send_count() == 1).await;

    queue.remove(id).await.unwrap();
    queue.remove(id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.send_count(), 1);
    assert!(fails.lock().unwrap().is_empty());
    assert!(queue.is_empty().await);
    assert!(operation_keys(&store).is_empty());
}

#[tokio::test(start_paused = true)]
async fn submit_resolves_with_the_final_outcome() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(|request| match request.target.as_str() {
        "/ok" => Reply::Ok(json!({"id": 1})),
        _ => Reply::Err(RequestError::from_status(500, "boom")),
    });
    let queue = engine(&store, &transport);
    queue.boot().await.unwrap();

    let ok = queue
        .submit(queue.new_operation(RequestDescriptor::post("/ok")))
        .await
        .unwrap();
    let failing = queue
        .submit(
            queue
                .new_operation(RequestDescriptor::post("/fail"))
                .with_retry(RetryPolicy::no_retry()),
        )
        .await
        .unwrap();

    assert_eq!(ok.wait().await.unwrap(), json!({"id": 1}));
    let err = failing.wait().await.unwrap_err();
    assert!(matches!(err, QueueError::Terminal { attempt: 0, .. }));
}

#[tokio::test(start_paused = true)]
async fn a_panicking_subscriber_does_not_stop_the_queue() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::ok();
    let queue = engine(&store, &transport);

    let _bad = queue.on_complete(|_| panic!("subscriber bug"));
    let completed = recorder::<CompleteOutcome>();
    let c = completed.clone();
    let _good = queue.on_complete(move |e| c.lock().unwrap().push(e.outcome));

    for target in ["/a", "/b"] {
        queue
            .enqueue(queue.new_operation(RequestDescriptor::post(target)))
            .await
            .unwrap();
    }
    queue.boot().await.unwrap();

    wait_until(|| completed.lock().unwrap().len() == 2).await;
    assert_eq!(transport.sent_targets(), vec!["/a", "/b"]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_handlers_stop_receiving() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::ok();
    let queue = engine(&store, &transport);
    queue.boot().await.unwrap();

    let seen = recorder::<String>();
    let s = seen.clone();
    let subscription = queue.on_success(move |e| {
        s.lock()
            .unwrap()
            .push(e.operation.request.target.clone())
    });

    queue
        .submit(queue.new_operation(RequestDescriptor::post("/a")))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    subscription.unsubscribe();
    queue
        .submit(queue.new_operation(RequestDescriptor::post("/b")))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["/a"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_pending_operations_queued() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::offline();
    let queue = engine(&store, &transport);

    let op = queue
        .new_operation(RequestDescriptor::post("/todos"))
        .durable(true)
        .with_retry(RetryPolicy::new(5, Backoff::new(Duration::from_secs(10), 1.0)));
    queue.enqueue(op).await.unwrap();
    queue.boot().await.unwrap();
    wait_until(|| transport.send_count() == 1).await;

    queue.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.send_count(), 1);
    assert_eq!(queue.len().await, 1);
    assert_eq!(operation_keys(&store).len(), 1);
    let late = queue
        .enqueue(queue.new_operation(RequestDescriptor::post("/late")))
        .await;
    assert!(matches!(late, Err(QueueError::InvalidState(_))));
}
