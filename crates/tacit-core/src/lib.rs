//! tacit-core
//!
//! Silent submission queue engine: durable, ordered, retrying execution of
//! queued mutation requests, with placeholder (virtual) values that later
//! operations can reference before the server has produced them.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, operation, retry, errors, events, virtual_value）
//! - **ports**: 抽象化レイヤー（DurableStore, Transport, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStore, FileStore）
//! - **queue**: キュー管理（registry, storage, dependency graph, virtual registry）
//! - **app**: アプリケーションロジック（builder, config, dispatcher, engine, events）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{
    BuildError, Outcome, SilentConfig, SilentQueue, SilentQueueBuilder, Submission, Subscription,
};
pub use domain::{
    Backoff, Behavior, ErrorCategory, FieldPath, OperationId, OperationStatus, Position,
    QueueError, QueuedOperation, RequestDescriptor, RequestError, RetryClassifier, RetryPolicy,
    StoreError, VirtualId, VirtualValue,
};
pub use ports::{DurableStore, Transport, TransportError};
