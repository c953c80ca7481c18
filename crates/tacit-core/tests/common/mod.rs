#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tacit_core::impls::InMemoryStore;
use tacit_core::{
    DurableStore, RequestDescriptor, RequestError, SilentConfig, SilentQueue, SilentQueueBuilder,
    Transport,
};
use tokio::time::Instant;

/// What the scripted transport does with one request.
pub enum Reply {
    Ok(Value),
    Err(RequestError),
    /// Never answers.
    Hang,
    /// Answers with the inner reply after a delay.
    After(Duration, Box<Reply>),
}

type Script = Box<dyn Fn(&RequestDescriptor) -> Reply + Send + Sync>;

/// Transport double that answers from a closure and records every send.
pub struct ScriptedTransport {
    script: Script,
    sent: Mutex<Vec<(RequestDescriptor, Instant)>>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&RequestDescriptor) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Every request succeeds with `{"ok": true}`.
    pub fn ok() -> Arc<Self> {
        Self::new(|_| Reply::Ok(json!({"ok": true})))
    }

    /// Every request fails with a network error.
    pub fn offline() -> Arc<Self> {
        Self::new(|_| Reply::Err(RequestError::network("offline")))
    }

    pub fn sent_targets(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(request, _)| request.target.clone())
            .collect()
    }

    pub fn sent_requests(&self) -> Vec<RequestDescriptor> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Value, RequestError> {
        self.sent
            .lock()
            .unwrap()
            .push((request.clone(), Instant::now()));
        let mut reply = (self.script)(request);
        loop {
            match reply {
                Reply::Ok(value) => return Ok(value),
                Reply::Err(error) => return Err(error),
                Reply::Hang => return std::future::pending().await,
                Reply::After(delay, next) => {
                    tokio::time::sleep(delay).await;
                    reply = *next;
                }
            }
        }
    }
}

pub fn engine(store: &Arc<InMemoryStore>, transport: &Arc<ScriptedTransport>) -> SilentQueue {
    engine_with(store, transport, SilentConfig::default())
}

pub fn engine_with(
    store: &Arc<InMemoryStore>,
    transport: &Arc<ScriptedTransport>,
    config: SilentConfig,
) -> SilentQueue {
    let store: Arc<dyn DurableStore> = store.clone();
    let transport: Arc<dyn Transport> = transport.clone();
    SilentQueueBuilder::new()
        .store(store)
        .transport(transport)
        .config(config)
        .rng_seed(7)
        .build()
        .expect("engine should build")
}

/// Shared event log for subscribers.
pub fn recorder<T: Send + 'static>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Polls `condition` on (paused) tokio time until it holds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..20_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Waits until one named queue has no operations left.
pub async fn wait_drained(queue: &SilentQueue, queue_name: &str) {
    for _ in 0..20_000 {
        if queue.snapshot(queue_name).await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue {queue_name} did not drain");
}

/// Waits until every queue is empty.
pub async fn wait_empty(queue: &SilentQueue) {
    for _ in 0..20_000 {
        if queue.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queues did not drain");
}

/// Persisted operation body keys.
pub fn operation_keys(store: &InMemoryStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|key| key.contains(".op."))
        .collect()
}
