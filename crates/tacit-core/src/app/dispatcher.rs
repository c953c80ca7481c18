//! Dispatcher - キューごとの実行ループ
//!
//! # フロー（1 operation あたり）
//! 1. 先頭の operation を取得（なければ worker 終了）
//! 2. 未解決の virtual value を参照していれば解決を待つ
//! 3. `before-dispatch` → `Transport::send`
//! 4. 成功: `success` → 生成する virtual value を解決 → remove → `complete`
//! 5. 失敗: `error` → リトライ可能なら `retry` + `complete` して sleep、
//!    そうでなければ `fail` + `complete`
//!
//! # 重要
//! - send と sleep は stop シグナル・shutdown と `select!` で競合させる
//! - エンジンのロックを保持したまま await しない

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::engine::{EngineState, Inner, SilentQueue, persistence_event};
use super::events::Event;
use crate::domain::errors::{QueueError, RequestError};
use crate::domain::events::{
    BeforeDispatchEvent, CompleteEvent, CompleteOutcome, ErrorEvent, RetryEvent, SuccessEvent,
};
use crate::domain::ids::{OperationId, VirtualId};
use crate::domain::operation::QueuedOperation;
use crate::queue::PendingDependency;

pub(crate) async fn run_queue(inner: Arc<Inner>, queue: String) {
    let engine = SilentQueue { inner };
    let mut shutdown = engine.inner.shutdown.subscribe();
    debug!(queue = %queue, "dispatcher started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let inner = &engine.inner;

        let mut state = inner.state.lock().await;
        let Some(head) = state.registry.front(&queue).cloned() else {
            state.workers.remove(&queue);
            debug!(queue = %queue, "queue drained");
            return;
        };
        let id = head.id;

        // dependency gate
        let pending = state.virtuals.pending_for(&head);
        if let Some(virtual_id) = unresolvable(&state, &head, &pending) {
            let events = engine.finalize_failed(
                &mut state,
                id,
                QueueError::UnresolvedDependency { virtual_id },
            );
            drop(state);
            inner.events.emit_all(events);
            continue;
        }
        if !pending.is_empty() {
            let notified = inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);
            debug!(queue = %queue, operation = %id, waiting_for = pending.len(), "waiting for virtual values");
            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        // start the attempt
        let stop = Arc::new(Notify::new());
        state.in_flight.insert(id, stop.clone());
        let mut events = Vec::new();
        if let Err(e) = state.registry.update(id, QueuedOperation::start_attempt) {
            events.push(persistence_event(Some(id), e));
        }
        let Some(operation) = state.registry.get(id).cloned() else {
            continue;
        };
        drop(state);
        events.push(Event::BeforeDispatch(BeforeDispatchEvent {
            operation: operation.clone(),
        }));
        inner.events.emit_all(events);
        debug!(queue = %queue, operation = %id, attempt = operation.attempt, "dispatching");

        let result = tokio::select! {
            result = inner.transport.send(&operation.request) => result,
            _ = stop.notified() => {
                debug!(queue = %queue, operation = %id, "in-flight attempt abandoned");
                continue;
            }
            _ = shutdown.changed() => break,
        };

        let mut state = inner.state.lock().await;
        if state.in_flight.remove(&id).is_none() || !state.registry.contains(id) {
            debug!(queue = %queue, operation = %id, "late response ignored");
            continue;
        }

        match result {
            Ok(response) => {
                drop(state);
                let mut succeeded = operation;
                succeeded.mark_succeeded();
                info!(queue = %queue, operation = %id, attempt = succeeded.attempt, "operation succeeded");
                inner.events.emit(&Event::Success(SuccessEvent {
                    operation: succeeded.clone(),
                    response: response.clone(),
                }));

                let events = {
                    let mut state = inner.state.lock().await;
                    complete_success(&engine, &mut state, &succeeded, response)
                };
                inner.events.emit_all(events);
            }
            Err(error) => {
                let retry = settle_failure(&engine, &mut state, &operation, error);
                drop(state);
                inner.events.emit_all(retry.events);
                if let Some((delay, stop)) = retry.wait {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.notified() => {
                            debug!(queue = %queue, operation = %id, "retry wait interrupted");
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
    }
    debug!(queue = %queue, "dispatcher stopped");
}

/// A placeholder the head operation waits for that can never resolve:
/// its producer left without resolving it, or sits behind the head in the
/// same queue. A value nobody produces yet stays pending until someone
/// resolves it.
fn unresolvable(
    state: &EngineState,
    head: &QueuedOperation,
    pending: &[PendingDependency],
) -> Option<VirtualId> {
    pending
        .iter()
        .find(|dependency| {
            dependency.producer_gone
                || dependency.producer.is_some_and(|producer| {
                    state
                        .registry
                        .get(producer)
                        .is_none_or(|op| op.queue_name == head.queue_name)
                })
        })
        .map(|dependency| dependency.virtual_id)
}

fn complete_success(
    engine: &SilentQueue,
    state: &mut EngineState,
    operation: &QueuedOperation,
    response: Value,
) -> Vec<Event> {
    let mut events = Vec::new();
    let id = operation.id;
    if let Some(binding) = &operation.produces {
        match state
            .virtuals
            .resolve(binding.virtual_id, response.clone(), Some(&binding.projection))
        {
            Ok(Some(resolution)) => events.extend(engine.apply_resolution(state, resolution)),
            Ok(None) => {}
            Err(e) => {
                warn!(operation = %id, virtual_id = %binding.virtual_id, error = %e, "failed to resolve produced value");
            }
        }
    }

    if let Err(e) = state.registry.remove(id) {
        events.push(persistence_event(Some(id), e));
    }
    state.virtuals.forget_operation(id);
    if let Some(waiter) = state.waiters.remove(&id) {
        let _ = waiter.send(Ok(response));
    }
    engine.inner.changed.notify_waiters();

    events.push(Event::Complete(CompleteEvent {
        operation_id: id,
        queue_name: operation.queue_name.clone(),
        outcome: CompleteOutcome::Succeeded,
    }));
    events
}

struct Settled {
    events: Vec<Event>,
    /// Backoff delay and stop signal when a retry was scheduled.
    wait: Option<(Duration, Arc<Notify>)>,
}

fn settle_failure(
    engine: &SilentQueue,
    state: &mut EngineState,
    operation: &QueuedOperation,
    error: RequestError,
) -> Settled {
    let id: OperationId = operation.id;
    let mut events = vec![Event::Error(ErrorEvent {
        operation: operation.clone(),
        error: error.clone(),
    })];

    let policy = &operation.retry_policy;
    if !policy.allows_retry(operation.attempt, &error) {
        let terminal = QueueError::Terminal {
            error,
            attempt: operation.attempt,
        };
        events.extend(engine.finalize_failed(state, id, terminal));
        return Settled { events, wait: None };
    }

    let mut backoff = policy.backoff.clone();
    if backoff.jitter.is_none() {
        backoff.jitter = Some(engine.inner.config.jitter);
    }
    let attempt = operation.attempt + 1;
    let delay = backoff.jittered_delay(attempt, &mut state.rng);
    if let Err(e) = state
        .registry
        .update(id, |op| {
            op.schedule_retry(error.to_string());
        })
    {
        events.push(persistence_event(Some(id), e));
    }
    let stop = Arc::new(Notify::new());
    state.in_flight.insert(id, stop.clone());

    warn!(
        queue = %operation.queue_name,
        operation = %id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "attempt failed, retry scheduled"
    );
    let retried = state
        .registry
        .get(id)
        .cloned()
        .unwrap_or_else(|| operation.clone());
    events.push(Event::Retry(RetryEvent {
        attempt,
        delay,
        operation: retried,
    }));
    events.push(Event::Complete(CompleteEvent {
        operation_id: id,
        queue_name: operation.queue_name.clone(),
        outcome: CompleteOutcome::RetryScheduled,
    }));
    Settled {
        events,
        wait: Some((delay, stop)),
    }
}
