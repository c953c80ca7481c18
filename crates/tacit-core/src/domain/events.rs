//! Events - キューのライフサイクルイベント
//!
//! Dispatcher が 1 attempt ごと・終了ごとに発行する payload 型。
//! すべて `Clone` で、購読者ごとに参照で渡される。

use std::time::Duration;

use serde_json::Value;

use super::errors::{QueueError, RequestError};
use super::ids::OperationId;
use super::operation::QueuedOperation;

/// Emitted right before every attempt (including retries).
#[derive(Debug, Clone)]
pub struct BeforeDispatchEvent {
    pub operation: QueuedOperation,
}

/// The transport accepted the request.
#[derive(Debug, Clone)]
pub struct SuccessEvent {
    pub operation: QueuedOperation,
    pub response: Value,
}

/// One attempt failed (whether or not it will be retried).
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub operation: QueuedOperation,
    pub error: RequestError,
}

/// A retry was scheduled.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// Retry number, starting at 1.
    pub attempt: u32,
    pub delay: Duration,
    pub operation: QueuedOperation,
}

/// The operation gave up: terminal error, exhausted budget, or manual stop.
#[derive(Debug, Clone)]
pub struct FailEvent {
    pub error: QueueError,
    pub attempt: u32,
    pub operation: QueuedOperation,
}

impl FailEvent {
    pub fn is_manual_stop(&self) -> bool {
        matches!(self.error, QueueError::ManualStop)
    }
}

/// How an attempt cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Succeeded,
    RetryScheduled,
    Failed,
}

/// Emitted after every attempt cycle, whatever its outcome.
#[derive(Debug, Clone)]
pub struct CompleteEvent {
    pub operation_id: OperationId,
    pub queue_name: String,
    pub outcome: CompleteOutcome,
}

/// Emitted once `boot()` has restored and started the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEvent {
    /// `false` when the persisted index could not be read or decoded.
    pub restored_ok: bool,
    pub queues: Vec<String>,
    pub operations: usize,

    /// Persisted entries that could not be restored.
    pub skipped: Vec<String>,
}

/// A store write failed on a path that does not surface errors to a caller.
#[derive(Debug, Clone)]
pub struct PersistenceErrorEvent {
    pub operation_id: Option<OperationId>,
    pub error: QueueError,
}
