//! Errors - 配送エラーの分類
//!
//! リモート collaborator が返すエラーは、送信境界で一度だけ分類されます。
//! CircuitBreaker はこの分類から導かれる「失敗として数えるか」の bool だけを見ます。

use std::fmt;

/// ErrorKind は配送エラーの分類
///
/// - Transient: 一時的なエラー（ネットワーク、5xx、タイムアウト）。リトライ対象。
/// - Permanent: 恒久的なエラー（payload 不正、4xx）。item 自体が悪い。
/// - BreakerOpen: リモートが落ちているため呼び出していない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    BreakerOpen,
}

impl ErrorKind {
    /// Does this kind count toward the circuit breaker failure threshold?
    ///
    /// A bad item must not trip the breaker and block healthy items.
    pub fn counts_as_failure(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::BreakerOpen => "breaker_open",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the remote submit collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    kind: ErrorKind,
    message: String,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} delivery error: {}", self.kind, self.message)
    }
}

impl std::error::Error for DeliveryError {}
