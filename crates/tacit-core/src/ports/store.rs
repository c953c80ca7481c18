//! DurableStore port - 永続化アダプタの抽象化
//!
//! キーと UTF-8 文字列だけを扱う 3 メソッドのインターフェース。
//! (de)serialization はすべてエンジン側（`queue::storage`）が担う。
//!
//! # 実装
//! - **InMemoryStore**: テスト・開発用（`impls::memory_store`）
//! - **FileStore**: ディレクトリ上の 1 キー 1 ファイル（`impls::file_store`）

use crate::domain::errors::StoreError;

/// DurableStore は queue の状態を再起動後も残すための key-value store
///
/// # 契約
/// - `set` が失敗した場合、以前に保存されていた値はそのまま残ること
/// - `get` は存在しないキーに対して `Ok(None)` を返す
/// - `remove` は存在しないキーに対しても成功する
///
/// # Thread Safety
/// - `Send + Sync` を要求（エンジンが `Arc<dyn DurableStore>` で共有する）
pub trait DurableStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}
