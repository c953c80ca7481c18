//! EventBus - イベント種別ごとの同期 pub/sub
//!
//! # 学習ポイント
//! - 購読者リストはスナップショットを取ってからロック外で呼び出す
//! - `catch_unwind` で購読者の panic を隔離する
//! - 明示的な `Subscription::unsubscribe`（drop では解除しない）

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::error;

use crate::domain::events::{
    BeforeDispatchEvent, BootEvent, CompleteEvent, ErrorEvent, FailEvent, PersistenceErrorEvent,
    RetryEvent, SuccessEvent,
};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Channel<E> {
    kind: &'static str,
    subscribers: Mutex<Vec<(u64, Handler<E>)>>,
}

impl<E: 'static> Channel<E> {
    fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<Handler<E>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    fn emit(&self, event: &E) {
        for handler in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(kind = self.kind, "event subscriber panicked");
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(subscriber, _)| *subscriber != id);
    }
}

/// Handle returned by every `on_*` registration.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stops future deliveries to this subscriber.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// One emission, queued while the engine lock is held and delivered after.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    BeforeDispatch(BeforeDispatchEvent),
    Success(SuccessEvent),
    Error(ErrorEvent),
    Retry(RetryEvent),
    Fail(FailEvent),
    Complete(CompleteEvent),
    Boot(BootEvent),
    PersistenceError(PersistenceErrorEvent),
}

pub struct EventBus {
    next_id: AtomicU64,
    before_dispatch: Arc<Channel<BeforeDispatchEvent>>,
    success: Arc<Channel<SuccessEvent>>,
    error: Arc<Channel<ErrorEvent>>,
    retry: Arc<Channel<RetryEvent>>,
    fail: Arc<Channel<FailEvent>>,
    complete: Arc<Channel<CompleteEvent>>,
    boot: Arc<Channel<BootEvent>>,
    persistence_error: Arc<Channel<PersistenceErrorEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            before_dispatch: Channel::new("before-dispatch"),
            success: Channel::new("success"),
            error: Channel::new("error"),
            retry: Channel::new("retry"),
            fail: Channel::new("fail"),
            complete: Channel::new("complete"),
            boot: Channel::new("boot"),
            persistence_error: Channel::new("persistence-error"),
        }
    }

    fn subscribe<E, F>(&self, channel: &Arc<Channel<E>>, handler: F) -> Subscription
    where
        E: Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        channel
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(handler)));
        let weak: Weak<Channel<E>> = Arc::downgrade(channel);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(channel) = weak.upgrade() {
                    channel.unsubscribe(id);
                }
            })),
        }
    }

    pub fn on_before_dispatch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BeforeDispatchEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.before_dispatch, handler)
    }

    pub fn on_success<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.success, handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.error, handler)
    }

    pub fn on_retry<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.retry, handler)
    }

    pub fn on_fail<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&FailEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.fail, handler)
    }

    pub fn on_complete<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&CompleteEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.complete, handler)
    }

    pub fn on_boot<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BootEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.boot, handler)
    }

    pub fn on_persistence_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PersistenceErrorEvent) + Send + Sync + 'static,
    {
        self.subscribe(&self.persistence_error, handler)
    }

    pub(crate) fn emit(&self, event: &Event) {
        match event {
            Event::BeforeDispatch(e) => self.before_dispatch.emit(e),
            Event::Success(e) => self.success.emit(e),
            Event::Error(e) => self.error.emit(e),
            Event::Retry(e) => self.retry.emit(e),
            Event::Fail(e) => self.fail.emit(e),
            Event::Complete(e) => self.complete.emit(e),
            Event::Boot(e) => self.boot.emit(e),
            Event::PersistenceError(e) => self.persistence_error.emit(e),
        }
    }

    pub(crate) fn emit_all(&self, events: Vec<Event>) {
        for event in &events {
            self.emit(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
