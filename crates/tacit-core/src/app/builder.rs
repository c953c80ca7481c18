//! SilentQueueBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::config::SilentConfig;
use super::engine::SilentQueue;
use crate::ports::{Clock, DurableStore, IdGenerator, SystemClock, Transport, UlidGenerator};
use crate::queue::{QueueRegistry, StorageKeys};

/// SilentQueueBuilder は SilentQueue を構築
///
/// # 使用例
/// ```ignore
/// let queue = SilentQueueBuilder::new()
///     .store(Arc::new(FileStore::open("./queue")?))
///     .transport(Arc::new(HttpTransport::new(client)))
///     .config(config)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - store と transport は必須
/// - build() 時に設定値（jitter, multiplier）を検証
/// - 不正なら BuildError を返す
pub struct SilentQueueBuilder {
    store: Option<Arc<dyn DurableStore>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: SilentConfig,
    rng_seed: Option<u64>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No durable store configured. Call `.store(...)` before `build()`.")]
    MissingStore,

    #[error("No transport configured. Call `.transport(...)` before `build()`.")]
    MissingTransport,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SilentQueueBuilder {
    /// 新しい SilentQueueBuilder を作成
    pub fn new() -> Self {
        Self {
            store: None,
            transport: None,
            clock: None,
            ids: None,
            config: SilentConfig::default(),
            rng_seed: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 省略時は SystemClock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 省略時は clock を使う UlidGenerator
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn config(mut self, config: SilentConfig) -> Self {
        self.config = config;
        self
    }

    /// jitter 用の乱数を固定する（テスト用）
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// 設定を検証して SilentQueue を生成
    ///
    /// # 検証
    /// - store / transport が設定されているか
    /// - jitter が [0, 1] に収まっているか
    /// - multiplier >= 1 か
    pub fn build(self) -> Result<SilentQueue, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        validate(&self.config)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let registry = QueueRegistry::new(
            store,
            StorageKeys::new(self.config.key_namespace.clone()),
            self.config.default_queue.clone(),
        );
        Ok(SilentQueue::from_parts(
            registry,
            transport,
            clock,
            ids,
            self.config,
            rng,
        ))
    }
}

fn validate(config: &SilentConfig) -> Result<(), BuildError> {
    if config.default_queue.is_empty() {
        return Err(BuildError::InvalidConfig(
            "default_queue must not be empty".to_string(),
        ));
    }
    if config.key_namespace.is_empty() {
        return Err(BuildError::InvalidConfig(
            "key_namespace must not be empty".to_string(),
        ));
    }
    let jitters = [Some(config.jitter), config.default_retry.backoff.jitter];
    if jitters.iter().flatten().any(|j| !(0.0..=1.0).contains(j)) {
        return Err(BuildError::InvalidConfig(format!(
            "jitter must be within [0, 1], got {:?}",
            jitters
        )));
    }
    let multiplier = config.default_retry.backoff.multiplier;
    if multiplier.is_nan() || multiplier < 1.0 {
        return Err(BuildError::InvalidConfig(format!(
            "backoff multiplier must be >= 1, got {multiplier}"
        )));
    }
    Ok(())
}

impl Default for SilentQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}
