//! Impls - port の実装
//!
//! - InMemoryStore: 開発・テスト用
//! - FileStore: ディレクトリベースの永続化（CLI で使用）

pub mod file_store;
pub mod memory_store;

pub use file_store::FileStore;
pub use memory_store::InMemoryStore;
