//! Settlement - ack/nack の結果

use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::ids::WorkItemId;
use super::item::ItemStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    /// The caller held the current lease and the transition was applied.
    Applied,
    /// The item was already `sent`/`failed`; nothing changed.
    AlreadyTerminal,
    /// The caller's lease had been reclaimed by the Reaper.
    LeaseLost,
}

/// Outcome of an ack or nack.
///
/// Ack and nack never fail for the benign cases of at-least-once delivery.
/// They report them here instead, and [`Settlement::warning`] turns the
/// noteworthy ones into a [`QueueError`] for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: WorkItemId,
    pub kind: SettlementKind,
    /// Status of the item after the call.
    pub status: ItemStatus,
    pub retry_count: u32,
}

impl Settlement {
    pub fn warning(&self) -> Option<QueueError> {
        match self.kind {
            SettlementKind::AlreadyTerminal => Some(QueueError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            }),
            SettlementKind::LeaseLost => Some(QueueError::LeaseLost { id: self.id }),
            SettlementKind::Applied if self.status == ItemStatus::Failed => {
                Some(QueueError::RetryExhausted {
                    id: self.id,
                    retry_count: self.retry_count,
                })
            }
            SettlementKind::Applied => None,
        }
    }
}
