//! Transport port - リモート呼び出しの抽象化
//!
//! HTTP クライアント等のアダプタはこの trait を実装する。
//! エンジンはレスポンスを JSON として受け取り、失敗は `TransportError`
//! の category でリトライ可否が判定される。

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::RequestError;
use crate::domain::operation::RequestDescriptor;

/// Failure reported by a transport for one attempt.
pub type TransportError = RequestError;

/// Transport は 1 件の request descriptor を実行する
///
/// # 注意
/// - タイムアウトはこの層では扱わない（アダプタ側の責務）
/// - 呼び出し中に `stop` された場合、結果は破棄される
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<Value, TransportError>;
}
