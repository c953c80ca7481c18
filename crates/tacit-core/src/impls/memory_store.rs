//! InMemoryStore - 開発・テスト用の DurableStore
//!
//! # 学習ポイント
//! - `std::sync::Mutex` で十分（ロック区間に await がない）
//! - 障害注入（`fail_writes`）で永続化失敗のパスをテストできる

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::domain::errors::StoreError;
use crate::ports::DurableStore;

/// InMemoryStore は BTreeMap に値を保持する DurableStore
///
/// Clone 可能なハンドルではないので、共有する場合は `Arc` で包む。
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` の間、`set` と `remove` がすべて失敗する
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 保存されているキー（昇順）
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// ストアを介さずに値を書き込む（壊れたデータの注入用）
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.lock().insert(key.to_string(), value.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(
        &self,
        key: &str,
        make: fn(String, String) -> StoreError,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(make(key.to_string(), "injected write failure".to_string()));
        }
        Ok(())
    }
}

impl DurableStore for InMemoryStore {
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_writable(key, |key, reason| StoreError::Write { key, reason })?;
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check_writable(key, |key, reason| StoreError::Remove { key, reason })?;
        self.lock().remove(key);
        Ok(())
    }
}
