//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてエンジンを実装します。
//!
//! # 主要コンポーネント
//! - **SilentQueueBuilder**: エンジンの構築とワイヤリング
//! - **SilentQueue**: 公開ファサード（enqueue / stop / boot / virtual value API）
//! - **dispatcher**: キューごとの実行ループ
//! - **EventBus**: ライフサイクルイベントの購読

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod events;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SilentQueueBuilder};
pub use self::config::SilentConfig;
pub use self::engine::{Outcome, SilentQueue, Submission};
pub use self::events::{EventBus, Subscription};
