//! SilentConfig - エンジン設定
//!
//! JSON から読み込める。省略したフィールドはデフォルト値になる。

use serde::{Deserialize, Serialize};

use crate::domain::operation::DEFAULT_QUEUE;
use crate::domain::retry::RetryPolicy;
use crate::queue::storage::DEFAULT_NAMESPACE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilentConfig {
    /// Queue used when an operation does not name one.
    pub default_queue: String,

    /// Prefix of every persisted key.
    pub key_namespace: String,

    /// Retry policy given to operations created through the engine.
    pub default_retry: RetryPolicy,

    /// Jitter fraction in `[0, 1]` for backoffs that do not set their own.
    pub jitter: f64,
}

impl Default for SilentConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            key_namespace: DEFAULT_NAMESPACE.to_string(),
            default_retry: RetryPolicy::default(),
            jitter: 0.0,
        }
    }
}

impl SilentConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
