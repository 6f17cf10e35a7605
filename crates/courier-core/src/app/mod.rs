//! App - アプリケーション層
//!
//! queue / resilience / ports を組み合わせて送信パイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **SubmitterBuilder**: submitter の構築とワイヤリング
//! - **AsyncSubmitter**: 並列数を制限した送信（submit_one / submit_all_pending）
//! - **StuckReaper**: Processing のまま止まった item の回収
//! - **RetrySweeper**: cooldown を過ぎた Failed item の再キュー
//! - **SubmitterHandle**: 監督ループの起動と停止

pub mod builder;
pub mod reaper_loop;
pub mod retry_loop;
pub mod run_loop;
pub mod submitter;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SubmitterBuilder};
pub use self::reaper_loop::StuckReaper;
pub use self::retry_loop::{RetrySweep, RetrySweeper};
pub use self::run_loop::SubmitterHandle;
pub use self::submitter::{AsyncSubmitter, BatchReport, SubmitOutcome, SubmitterState};
