//! courier-core
//!
//! Durable offline submission queue: records produced locally are written to
//! disk first and delivered to a remote collector later, surviving crashes,
//! network outages and collector downtime.
//!
//! # モジュール構成
//! - **queue**: QueueItem の状態遷移、retry policy、ディレクトリ永続化（PersistentQueue）
//! - **resilience**: CircuitBreaker、RateLimiter
//! - **app**: AsyncSubmitter と監督ループ（stuck 回収、失敗 item の再キュー）
//! - **bridge**: 同期コードから async パイプラインを呼ぶための EventLoopPool / SyncRunner
//! - **ports**: 外部依存の抽象（RemoteSubmitter、Clock）
//! - **domain**: 配送エラーの分類、item id
//! - config / error / observability: 設定、エラー型、カウンタ

pub mod app;
pub mod bridge;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod resilience;

pub use app::{AsyncSubmitter, SubmitterBuilder, SubmitterHandle};
pub use config::{CircuitBreakerConfig, CourierConfig, QueueConfig, RateLimiterConfig, SubmitterConfig};
pub use domain::{DeliveryError, ErrorKind};
pub use error::{BreakerError, BridgeError, ConfigError, QueueError, QueueResult, SubmitterError};
pub use observability::{QueueCounts, SubmitterStats};
pub use ports::RemoteSubmitter;
pub use queue::{ItemStatus, PersistentQueue, QueueItem};
