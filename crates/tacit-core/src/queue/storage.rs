//! Persisted key layout and codec.
//!
//! - `<ns>.queues`: index document `{"<queue>": ["op-…", …]}`
//! - `<ns>.op.<operation-id>`: one serialized `QueuedOperation` per key
//!
//! Request payloads are stored as-is: unresolved placeholders are already in
//! their marker (dehydrated) form and resolved ones have been substituted.

use std::collections::BTreeMap;

use crate::domain::errors::QueueError;
use crate::domain::ids::OperationId;
use crate::domain::operation::QueuedOperation;

pub const DEFAULT_NAMESPACE: &str = "tacit.silent";

/// Queue name → ordered operation ids, as persisted.
pub type QueueIndex = BTreeMap<String, Vec<OperationId>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    namespace: String,
}

impl StorageKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn index(&self) -> String {
        format!("{}.queues", self.namespace)
    }

    pub fn operation(&self, id: OperationId) -> String {
        format!("{}.op.{}", self.namespace, id)
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

pub fn encode_index(index: &QueueIndex) -> Result<String, QueueError> {
    serde_json::to_string(index).map_err(|e| QueueError::Codec {
        key: "index".to_string(),
        reason: e.to_string(),
    })
}

pub fn decode_index(key: &str, raw: &str) -> Result<QueueIndex, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub fn encode_operation(operation: &QueuedOperation) -> Result<String, QueueError> {
    serde_json::to_string(operation).map_err(|e| QueueError::Codec {
        key: operation.id.to_string(),
        reason: e.to_string(),
    })
}

/// Decodes a body and checks it belongs to the id the index listed.
pub fn decode_operation(
    key: &str,
    expected: OperationId,
    raw: &str,
) -> Result<QueuedOperation, QueueError> {
    let operation: QueuedOperation = serde_json::from_str(raw).map_err(|e| QueueError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if operation.id != expected {
        return Err(QueueError::Codec {
            key: key.to_string(),
            reason: format!("body belongs to {}", operation.id),
        });
    }
    Ok(operation)
}
