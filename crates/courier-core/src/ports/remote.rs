//! RemoteSubmitter port - 送信先（collector）の抽象化
//!
//! HTTP / 認証 / transport レベルの retry は実装側の責務。
//! core が持つのはアプリケーションレベルの retry policy だけ。

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::DeliveryError;

/// RemoteSubmitter は payload を 1 件送信する
///
/// # 契約
/// - `Ok(())` は collector が受理したことを意味する
/// - 失敗時は `DeliveryError` の kind で分類する
///   - `Transient`: ネットワーク断、5xx、timeout（breaker の失敗に数える）
///   - `Permanent`: payload 自体が不正（breaker には数えない）
/// - 同じ payload が 2 回届く可能性がある（at-least-once）
#[async_trait]
pub trait RemoteSubmitter: Send + Sync {
    async fn submit(&self, payload: &Value) -> Result<(), DeliveryError>;
}
