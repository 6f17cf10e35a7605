//! Ports - 抽象化レイヤー
//!
//! core が外部に依存する箇所（送信先、時刻）をここで trait として定義する。

pub mod clock;
pub mod remote;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::remote::RemoteSubmitter;
