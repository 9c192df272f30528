//! SideEffect port - worker が実行する作業本体
//!
//! At-least-once なので、同じ item に対して複数回呼ばれることがあります。
//! 実装は冪等でなければなりません（これは engine ではなく実装側の契約）。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::WorkItem;

/// A failed side effect. The message ends up in the item's `error` column.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

#[async_trait]
pub trait SideEffect: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<(), ExecutionError>;
}
