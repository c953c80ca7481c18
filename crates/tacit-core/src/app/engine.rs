//! SilentQueue - エンジンの公開ファサード
//!
//! # 構成
//! - すべての可変状態は 1 つの `tokio::sync::Mutex<EngineState>` の中にある
//! - transport 呼び出しと backoff の sleep の間はロックを保持しない
//! - イベントはロックを外してから発行する（購読者がエンジンを呼べるように）
//!
//! # 使用例
//! ```ignore
//! let queue = SilentQueueBuilder::new()
//!     .store(Arc::new(InMemoryStore::new()))
//!     .transport(Arc::new(MyTransport))
//!     .build()?;
//! queue.boot().await?;
//!
//! let todo = queue.create_virtual(json!({"id": null})).await;
//! let create = queue
//!     .new_operation(RequestDescriptor::post("/todos").with_body(json!({"title": "a"})))
//!     .produces(todo.id);
//! queue.enqueue(create).await?;
//!
//! let tag = queue.new_operation(
//!     RequestDescriptor::post(format!("/todos/{}/tags", todo.reference().marker())),
//! );
//! queue.enqueue(tag).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::SilentConfig;
use super::dispatcher;
use super::events::{Event, EventBus, Subscription};
use crate::domain::errors::QueueError;
use crate::domain::events::{
    BeforeDispatchEvent, BootEvent, CompleteEvent, CompleteOutcome, ErrorEvent, FailEvent,
    PersistenceErrorEvent, RetryEvent, SuccessEvent,
};
use crate::domain::ids::{OperationId, VirtualId};
use crate::domain::operation::{
    OperationStatus, Position, QueuedOperation, RequestDescriptor,
};
use crate::domain::virtual_value::{self, FieldPath, VirtualValue, rewrite_field, substitute};
use crate::ports::{Clock, IdGenerator, Transport};
use crate::queue::{QueueRegistry, Resolution, RestoreReport, VirtualRegistry};

/// Final result delivered to a [`Submission`].
pub type Outcome = Result<Value, QueueError>;

/// Handle returned by [`SilentQueue::submit`].
#[derive(Debug)]
pub struct Submission {
    pub operation_id: OperationId,
    completion: oneshot::Receiver<Outcome>,
}

impl Submission {
    /// Waits for the operation to succeed or fail for good.
    pub async fn wait(self) -> Outcome {
        match self.completion.await {
            Ok(outcome) => outcome,
            Err(_) => Err(QueueError::InvalidState(format!(
                "{} was dropped before completion",
                self.operation_id
            ))),
        }
    }
}

pub(crate) struct EngineState {
    pub(crate) registry: QueueRegistry,
    pub(crate) virtuals: VirtualRegistry,
    pub(crate) booted: bool,
    pub(crate) shut_down: bool,

    /// One worker per non-empty queue.
    pub(crate) workers: HashMap<String, JoinHandle<()>>,

    /// Stop signals of operations that are dispatching or waiting for a retry.
    pub(crate) in_flight: HashMap<OperationId, Arc<Notify>>,

    pub(crate) waiters: HashMap<OperationId, oneshot::Sender<Outcome>>,
    pub(crate) rng: StdRng,
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) events: EventBus,
    pub(crate) config: SilentConfig,

    /// Woken whenever a virtual value resolves or an operation leaves its queue.
    pub(crate) changed: Notify,

    pub(crate) shutdown: watch::Sender<bool>,
}

/// Durable, ordered, retrying submission queue.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct SilentQueue {
    pub(crate) inner: Arc<Inner>,
}

impl SilentQueue {
    pub(crate) fn from_parts(
        registry: QueueRegistry,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: SilentConfig,
        rng: StdRng,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let state = EngineState {
            registry,
            virtuals: VirtualRegistry::new(),
            booted: false,
            shut_down: false,
            workers: HashMap::new(),
            in_flight: HashMap::new(),
            waiters: HashMap::new(),
            rng,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                transport,
                clock,
                ids,
                events: EventBus::new(),
                config,
                changed: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SilentConfig {
        &self.inner.config
    }

    /// A pending operation with a fresh id, the default queue and the default retry policy.
    pub fn new_operation(&self, request: RequestDescriptor) -> QueuedOperation {
        QueuedOperation::new(
            self.inner.ids.generate_operation_id(),
            request,
            self.inner.clock.now(),
        )
        .in_queue(self.inner.config.default_queue.clone())
        .with_retry(self.inner.config.default_retry.clone())
    }

    // ========================================
    // Queue control
    // ========================================

    /// Appends an operation to the tail of its queue.
    pub async fn enqueue(&self, operation: QueuedOperation) -> Result<OperationId, QueueError> {
        self.enqueue_at(operation, Position::Tail).await
    }

    /// Adds an operation at the given position.
    ///
    /// Durable operations are persisted before this returns. Operations
    /// enqueued before [`boot`](Self::boot) are held until boot.
    pub async fn enqueue_at(
        &self,
        operation: QueuedOperation,
        position: Position,
    ) -> Result<OperationId, QueueError> {
        let mut state = self.inner.state.lock().await;
        self.enqueue_locked(&mut state, operation, position)
    }

    /// Enqueues at the tail and returns a handle resolving with the final outcome.
    pub async fn submit(&self, operation: QueuedOperation) -> Result<Submission, QueueError> {
        let mut state = self.inner.state.lock().await;
        let operation_id = self.enqueue_locked(&mut state, operation, Position::Tail)?;
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(operation_id, tx);
        Ok(Submission {
            operation_id,
            completion: rx,
        })
    }

    fn enqueue_locked(
        &self,
        state: &mut EngineState,
        mut operation: QueuedOperation,
        position: Position,
    ) -> Result<OperationId, QueueError> {
        if state.shut_down {
            return Err(QueueError::InvalidState("queue is shut down".to_string()));
        }
        let id = operation.id;
        operation.status = OperationStatus::Pending;
        let hydrated = state.virtuals.hydrate(&operation.request.to_value());
        operation.request.apply_value(hydrated);

        if let Err(e) = link_operation(&mut state.virtuals, &operation) {
            state.virtuals.forget_operation(id);
            return Err(e);
        }
        let queue_name = operation.queue_name.clone();
        if let Err(e) = state.registry.enqueue(operation, position) {
            state.virtuals.forget_operation(id);
            return Err(e);
        }
        if state.booted {
            self.ensure_worker(state, &queue_name);
        }
        Ok(id)
    }

    /// Withdraws an operation from its queue and the store. Absent ids are a no-op.
    ///
    /// An in-flight attempt is abandoned without `fail`/`complete` events.
    pub async fn remove(&self, operation_id: OperationId) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        if let Some(signal) = state.in_flight.remove(&operation_id) {
            signal.notify_one();
        }
        let result = state.registry.remove(operation_id);
        let removed = match &result {
            Ok(removed) => removed.is_some(),
            Err(_) => true,
        };
        if removed {
            state.virtuals.forget_operation(operation_id);
            if let Some(waiter) = state.waiters.remove(&operation_id) {
                let _ = waiter.send(Err(QueueError::InvalidState(format!(
                    "{operation_id} was removed before completion"
                ))));
            }
            self.inner.changed.notify_waiters();
            debug!(operation = %operation_id, "operation withdrawn");
        }
        result.map(|_| ())
    }

    /// Stops an operation that is dispatching or waiting for a retry.
    ///
    /// The operation fails with [`QueueError::ManualStop`] right away and the
    /// queue moves on; a late response is ignored.
    pub async fn stop(&self, operation_id: OperationId) -> Result<(), QueueError> {
        let events = {
            let mut state = self.inner.state.lock().await;
            let stoppable = state
                .registry
                .get(operation_id)
                .is_some_and(|op| op.status.is_in_flight())
                && state.in_flight.contains_key(&operation_id);
            if !stoppable {
                return Err(QueueError::no_retry_in_flight(operation_id));
            }
            if let Some(signal) = state.in_flight.remove(&operation_id) {
                signal.notify_one();
            }
            info!(operation = %operation_id, "operation stopped manually");
            self.finalize_failed(&mut state, operation_id, QueueError::ManualStop)
        };
        self.inner.events.emit_all(events);
        Ok(())
    }

    /// Ordered copies of one queue's operations.
    pub async fn snapshot(&self, queue_name: &str) -> Vec<QueuedOperation> {
        self.inner.state.lock().await.registry.snapshot(queue_name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.inner.state.lock().await.registry.queue_names()
    }

    /// Number of operations currently queued, across queues.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.registry.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reads the persisted queues without changing the live ones.
    pub async fn restore_from_store(&self) -> RestoreReport {
        self.inner.state.lock().await.registry.restore_from_store()
    }

    /// Restores persisted operations ahead of anything enqueued so far,
    /// starts one worker per non-empty queue and emits `boot`.
    pub async fn boot(&self) -> Result<BootEvent, QueueError> {
        let (boot, events) = {
            let mut state = self.inner.state.lock().await;
            if state.booted {
                return Err(QueueError::InvalidState("queue is already booted".to_string()));
            }
            if state.shut_down {
                return Err(QueueError::InvalidState("queue is shut down".to_string()));
            }
            let mut events = Vec::new();

            let report = state.registry.restore_from_store();
            let restored_queues: Vec<String> = report.queues.keys().cloned().collect();
            let restored_count = report.operation_count();
            let mut restored = report.queues;
            let mut restored_ids = Vec::new();
            for operation in restored.values_mut().flatten() {
                operation.reset_after_restart();
                restored_ids.push(operation.id);
            }
            if let Err(e) = state.registry.merge_restored(restored) {
                events.push(persistence_event(None, e));
            }

            let restored_ops: Vec<QueuedOperation> = restored_ids
                .iter()
                .filter_map(|id| state.registry.get(*id).cloned())
                .collect();
            for operation in &restored_ops {
                if let Err(e) = state.virtuals.relink(operation) {
                    warn!(operation = %operation.id, error = %e, "failed to relink virtual values");
                }
            }

            state.booted = true;
            for queue_name in state.registry.non_empty_queues() {
                self.ensure_worker(&mut state, &queue_name);
            }

            let boot = BootEvent {
                restored_ok: report.restored_ok,
                queues: restored_queues,
                operations: restored_count,
                skipped: report.skipped.into_iter().map(|s| s.key).collect(),
            };
            info!(
                restored_ok = boot.restored_ok,
                operations = boot.operations,
                skipped = boot.skipped.len(),
                "silent queue booted"
            );
            events.push(Event::Boot(boot.clone()));
            (boot, events)
        };
        self.inner.events.emit_all(events);
        Ok(boot)
    }

    /// Stops every worker. Queued operations stay queued (and persisted).
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock().await;
            state.shut_down = true;
            self.inner.shutdown.send_replace(true);
            state.workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("silent queue shut down");
    }

    // ========================================
    // Virtual values
    // ========================================

    /// Allocates a placeholder for a value the server has not produced yet.
    pub async fn create_virtual(&self, shape: Value) -> VirtualValue {
        let id = self.inner.ids.generate_virtual_id();
        self.inner.state.lock().await.virtuals.create(id, shape)
    }

    pub async fn virtual_value(&self, id: VirtualId) -> Option<VirtualValue> {
        self.inner.state.lock().await.virtuals.get(id).cloned()
    }

    pub async fn register_dependency(
        &self,
        virtual_id: VirtualId,
        operation_id: OperationId,
        field_path: FieldPath,
    ) -> Result<(), QueueError> {
        self.inner
            .state
            .lock()
            .await
            .virtuals
            .register_dependency(virtual_id, operation_id, field_path)
    }

    /// Resolves a placeholder and rewrites every dependent request.
    ///
    /// Rewrites are applied in memory even when persisting one fails; the
    /// first store failure is returned.
    pub async fn resolve(&self, virtual_id: VirtualId, real_value: Value) -> Result<(), QueueError> {
        self.resolve_projected(virtual_id, real_value, None).await
    }

    pub async fn resolve_projected(
        &self,
        virtual_id: VirtualId,
        real_value: Value,
        projection: Option<&FieldPath>,
    ) -> Result<(), QueueError> {
        let events = {
            let mut state = self.inner.state.lock().await;
            let Some(resolution) = state.virtuals.resolve(virtual_id, real_value, projection)?
            else {
                return Ok(());
            };
            self.apply_resolution(&mut state, resolution)
        };
        let first_failure = events.iter().find_map(|event| match event {
            Event::PersistenceError(e) => Some(e.error.clone()),
            _ => None,
        });
        self.inner.events.emit_all(events);
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn is_virtual(&self, value: &Value) -> bool {
        virtual_value::is_virtual(value)
    }

    pub async fn equals(&self, a: &Value, b: &Value) -> bool {
        self.inner.state.lock().await.virtuals.equals(a, b)
    }

    pub async fn dehydrate(&self, value: &Value) -> Value {
        self.inner.state.lock().await.virtuals.dehydrate(value)
    }

    pub async fn hydrate(&self, value: &Value) -> Value {
        self.inner.state.lock().await.virtuals.hydrate(value)
    }

    // ========================================
    // Events
    // ========================================

    pub fn on_before_dispatch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BeforeDispatchEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_before_dispatch(handler)
    }

    pub fn on_success<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_success(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_error(handler)
    }

    pub fn on_retry<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_retry(handler)
    }

    pub fn on_fail<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&FailEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_fail(handler)
    }

    pub fn on_complete<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&CompleteEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_complete(handler)
    }

    pub fn on_boot<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BootEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_boot(handler)
    }

    pub fn on_persistence_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PersistenceErrorEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_persistence_error(handler)
    }

    // ========================================
    // Shared state transitions (engine lock held)
    // ========================================

    pub(crate) fn ensure_worker(&self, state: &mut EngineState, queue_name: &str) {
        if state.shut_down || state.workers.contains_key(queue_name) {
            return;
        }
        let handle = tokio::spawn(dispatcher::run_queue(
            self.inner.clone(),
            queue_name.to_string(),
        ));
        state.workers.insert(queue_name.to_string(), handle);
        debug!(queue = %queue_name, "queue worker started");
    }

    /// Marks an operation failed, removes it and notifies its waiter.
    /// Returns the `fail` and `complete` events to emit.
    pub(crate) fn finalize_failed(
        &self,
        state: &mut EngineState,
        operation_id: OperationId,
        error: QueueError,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let Some(mut operation) = state.registry.get(operation_id).cloned() else {
            return events;
        };
        if matches!(error, QueueError::ManualStop) {
            operation.mark_stopped();
        } else {
            operation.mark_failed(error.to_string());
        }
        warn!(
            queue = %operation.queue_name,
            operation = %operation_id,
            attempt = operation.attempt,
            error = %error,
            "operation failed"
        );

        if let Err(e) = state.registry.remove(operation_id) {
            events.push(persistence_event(Some(operation_id), e));
        }
        state.in_flight.remove(&operation_id);
        state.virtuals.forget_operation(operation_id);
        if let Some(waiter) = state.waiters.remove(&operation_id) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.inner.changed.notify_waiters();

        let queue_name = operation.queue_name.clone();
        events.push(Event::Fail(FailEvent {
            attempt: operation.attempt,
            error,
            operation,
        }));
        events.push(Event::Complete(CompleteEvent {
            operation_id,
            queue_name,
            outcome: CompleteOutcome::Failed,
        }));
        events
    }

    /// Rewrites every dependent request with the resolved value and persists durable ones.
    ///
    /// Each registered field gets the value written at its path (or its markers
    /// substituted); markers elsewhere in the request are substituted too.
    pub(crate) fn apply_resolution(
        &self,
        state: &mut EngineState,
        resolution: Resolution,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let mut fields: BTreeMap<OperationId, Vec<&FieldPath>> = BTreeMap::new();
        for dependent in &resolution.dependents {
            fields
                .entry(dependent.operation_id)
                .or_default()
                .push(&dependent.path);
        }
        for (operation_id, paths) in &fields {
            let result = state.registry.update(*operation_id, |operation| {
                let mut request = operation.request.to_value();
                let mut rewritten = 0;
                for path in paths.iter().filter(|path| !path.is_root()) {
                    rewritten +=
                        rewrite_field(&mut request, path, resolution.virtual_id, &resolution.value);
                }
                rewritten += substitute(&mut request, resolution.virtual_id, &resolution.value);
                if rewritten > 0 {
                    operation.request.apply_value(request);
                }
            });
            if let Err(e) = result {
                events.push(persistence_event(Some(*operation_id), e));
            }
        }
        debug!(
            virtual_id = %resolution.virtual_id,
            operations = fields.len(),
            fields = resolution.dependents.len(),
            "dependent requests rewritten"
        );
        self.inner.changed.notify_waiters();
        events
    }
}

/// Declares the operation's produced value and registers its placeholder fields.
fn link_operation(
    virtuals: &mut VirtualRegistry,
    operation: &QueuedOperation,
) -> Result<(), QueueError> {
    if let Some(binding) = &operation.produces {
        virtuals.set_producer(binding.virtual_id, operation.id)?;
    }
    for (found, path) in operation.virtual_dependencies() {
        virtuals.register_dependency(found.id, operation.id, path)?;
    }
    Ok(())
}

pub(crate) fn persistence_event(operation_id: Option<OperationId>, error: QueueError) -> Event {
    warn!(
        operation = ?operation_id.map(|id| id.to_string()),
        error = %error,
        "persistence failure"
    );
    Event::PersistenceError(PersistenceErrorEvent {
        operation_id,
        error,
    })
}
