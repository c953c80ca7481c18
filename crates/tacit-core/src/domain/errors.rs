//! Errors - エラー型と分類
//!
//! - `RequestError`: transport が返す 1 attempt 分の失敗（category で分類）
//! - `StoreError`: DurableStore の読み書き失敗
//! - `QueueError`: エンジンが呼び出し元・イベントに渡すエラー

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{OperationId, VirtualId};

/// Coarse category of a failed request, used by retry classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused, DNS failure, offline.
    Network,
    Timeout,
    /// 5xx responses.
    Server,
    /// 4xx responses.
    Client,
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Other => "other",
        };
        f.write_str(s)
    }
}

/// One failed execution of a request descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{category} error: {message}")]
pub struct RequestError {
    pub category: ErrorCategory,
    pub message: String,

    /// Response status, when the failure came from a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl RequestError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    /// Builds an error from a response status (5xx → Server, 4xx → Client).
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let category = match status {
            500..=599 => ErrorCategory::Server,
            400..=499 => ErrorCategory::Client,
            _ => ErrorCategory::Other,
        };
        Self {
            category,
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Failure of the durable store adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to write `{key}`: {reason}")]
    Write { key: String, reason: String },

    #[error("failed to read `{key}`: {reason}")]
    Read { key: String, reason: String },

    #[error("failed to remove `{key}`: {reason}")]
    Remove { key: String, reason: String },
}

impl StoreError {
    pub fn key(&self) -> &str {
        match self {
            StoreError::Write { key, .. }
            | StoreError::Read { key, .. }
            | StoreError::Remove { key, .. } => key,
        }
    }
}

/// Errors surfaced by the queue engine.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The attempt failed but the operation's policy allows another one.
    #[error("recoverable request error: {0}")]
    Recoverable(RequestError),

    /// The operation gave up: the error was not recoverable or the retry
    /// budget is spent.
    #[error("request failed after {attempt} retries: {error}")]
    Terminal { error: RequestError, attempt: u32 },

    #[error("retry stopped manually")]
    ManualStop,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("virtual value {virtual_id} is already resolved to a different value")]
    DoubleResolution { virtual_id: VirtualId },

    #[error("dependency cycle between operations: {cycle:?}")]
    DependencyCycle { cycle: Vec<OperationId> },

    #[error("unknown virtual value {0}")]
    UnknownVirtual(VirtualId),

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    /// The request references a placeholder that can no longer be resolved
    /// before the operation runs.
    #[error("virtual value {virtual_id} will never resolve: its producer is gone or queued behind")]
    UnresolvedDependency { virtual_id: VirtualId },

    #[error("corrupt entry `{key}`: {reason}")]
    Codec { key: String, reason: String },
}

impl QueueError {
    pub fn no_retry_in_flight(operation_id: OperationId) -> Self {
        QueueError::InvalidState(format!("there is no request being retried for {operation_id}"))
    }
}
