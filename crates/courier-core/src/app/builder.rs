//! SubmitterBuilder - submitter の構築とワイヤリング
//!
//! # 方針
//! - Builder パターンで依存（queue, remote, breaker, limiter, clock）を注入
//! - 起動時検証（Fail-fast 設計）: 使えない設定は build() で弾く
//! - 省略された依存はデフォルト実装で埋める

use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, watch};

use super::reaper_loop::StuckReaper;
use super::retry_loop::RetrySweeper;
use super::submitter::{AsyncSubmitter, SubmitterState};
use crate::config::{CourierConfig, SubmitterConfig};
use crate::observability::SubmitterStats;
use crate::ports::{Clock, RemoteSubmitter, SystemClock};
use crate::queue::PersistentQueue;
use crate::resilience::{CircuitBreaker, RateLimiter};

/// 省略時の breaker 名
pub const DEFAULT_BREAKER_NAME: &str = "remote";

/// SubmitterBuilder は AsyncSubmitter を構築
///
/// # 使用例
/// ```ignore
/// let submitter = SubmitterBuilder::new(queue, remote)
///     .config(SubmitterConfig { max_concurrent: 2, ..Default::default() })
///     .limiter(Arc::new(RateLimiter::disabled()))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - max_concurrent == 0 は永久に何も送れないので BuildError
/// - retry_jitter は 0.0..=1.0 の範囲外なら BuildError
pub struct SubmitterBuilder {
    queue: Arc<PersistentQueue>,
    remote: Arc<dyn RemoteSubmitter>,
    config: SubmitterConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    clock: Option<Arc<dyn Clock>>,
}

/// BuildError は submitter 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("retry_jitter must be within 0.0..=1.0, got {0}")]
    InvalidJitter(f64),
}

impl SubmitterBuilder {
    pub fn new(queue: Arc<PersistentQueue>, remote: Arc<dyn RemoteSubmitter>) -> Self {
        Self {
            queue,
            remote,
            config: SubmitterConfig::default(),
            breaker: None,
            limiter: None,
            clock: None,
        }
    }

    /// 設定ファイル全体から breaker / limiter を組み立てる
    pub fn from_config(
        queue: Arc<PersistentQueue>,
        remote: Arc<dyn RemoteSubmitter>,
        config: &CourierConfig,
    ) -> Self {
        Self::new(queue, remote)
            .config(config.submitter.clone())
            .breaker(Arc::new(CircuitBreaker::new(
                DEFAULT_BREAKER_NAME,
                config.breaker.clone(),
            )))
            .limiter(Arc::new(RateLimiter::new(config.rate_limit.clone())))
    }

    pub fn config(mut self, config: SubmitterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// 時刻の差し替え（テストでは FixedClock）
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Arc<AsyncSubmitter>, BuildError> {
        if self.config.max_concurrent == 0 {
            return Err(BuildError::ZeroConcurrency);
        }
        if !(0.0..=1.0).contains(&self.config.retry_jitter) {
            return Err(BuildError::InvalidJitter(self.config.retry_jitter));
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(AsyncSubmitter {
            queue: self.queue,
            remote: self.remote,
            breaker: self.breaker.unwrap_or_else(|| {
                Arc::new(CircuitBreaker::new(DEFAULT_BREAKER_NAME, Default::default()))
            }),
            limiter: self.limiter.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent)),
            reaper: StuckReaper::new(self.config.stuck_after()),
            sweeper: RetrySweeper::new(self.config.retry_policy()),
            state: Mutex::new(SubmitterState::Created),
            stats: Mutex::new(SubmitterStats::default()),
            shutdown,
            config: self.config,
        }))
    }
}
