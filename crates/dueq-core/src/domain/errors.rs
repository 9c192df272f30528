//! Errors - エラー型と分類
//!
//! `QueueError` は engine が返す唯一のエラー型です。
//! `ErrorKind` は運用上の分類で、呼び出し側のリトライ判断に使います。

use thiserror::Error;

use super::ids::WorkItemId;
use super::item::ItemStatus;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（ローカルでバックオフしてリトライ）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: 設定やデータ破損など、人手の介入が必要なもの
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Enqueue would create a second uncompleted item for the same subject.
    #[error("an uncompleted work item already exists for subject {subject_id}")]
    DuplicateWorkItem { subject_id: String },

    #[error("work item not found: {0}")]
    NotFound(WorkItemId),

    /// Benign under at-least-once delivery: the item was settled before.
    #[error("work item {id} is already terminal ({status})")]
    AlreadyTerminal { id: WorkItemId, status: ItemStatus },

    /// The Reaper reclaimed the item before this ack/nack arrived.
    /// The side effect may have run twice.
    #[error("lease lost for work item {id}; another worker may have processed it")]
    LeaseLost { id: WorkItemId },

    #[error("work item {id} exhausted its retries ({retry_count} attempts) and is frozen at failed")]
    RetryExhausted { id: WorkItemId, retry_count: u32 },

    /// Contention, timeouts, dropped connections.
    #[error("store error during {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("corrupt work item row: {0}")]
    Corrupt(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Store { .. } => ErrorKind::Transient,
            QueueError::DuplicateWorkItem { .. }
            | QueueError::NotFound(_)
            | QueueError::AlreadyTerminal { .. }
            | QueueError::LeaseLost { .. }
            | QueueError::RetryExhausted { .. } => ErrorKind::Permanent,
            QueueError::Corrupt(_) | QueueError::Config(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
