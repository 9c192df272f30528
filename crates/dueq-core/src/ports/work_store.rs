//! WorkStore port - work item の正本（source of truth）
//!
//! WorkStore は以下を管理します：
//! - hot table（WorkItem の状態・lease・retry メタデータ）
//! - cold table（ArchiveRecord、append-only）
//!
//! # 設計原則
//! - 全ての状態遷移は行単位で atomic（compare-and-swap）
//! - 競合した行は待たずにスキップ（claim / reap は skip-locked 相当）
//! - worker 間の調整はストア経由のみ。外部ロックマネージャは持たない
//!
//! # 実装
//! - `InMemoryWorkStore`（テスト・単一プロセス）
//! - `PostgresWorkStore`（本番）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::status::QueueCounts;
use crate::domain::{
    ArchiveRecord, LeasePolicy, LeaseToken, NewWorkItem, QueueError, RetryPolicy, Settlement,
    WorkItem, WorkItemId,
};

/// An item handed to a worker by `claim`, plus the token of this claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedItem {
    pub item: WorkItem,
    pub token: LeaseToken,
}

impl ClaimedItem {
    pub fn receipt(&self) -> Receipt {
        Receipt {
            id: self.item.id,
            token: self.token,
        }
    }
}

/// What a worker presents back on ack/nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
    pub id: WorkItemId,
    pub token: LeaseToken,
}

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert a new `pending` item.
    ///
    /// Fails with [`QueueError::DuplicateWorkItem`] when an uncompleted item
    /// already exists for the same subject.
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItemId, QueueError>;

    /// Atomically move up to `capacity` eligible items to `processing`.
    ///
    /// Eligible: `pending`, `scheduled_for <= now`, under the retry cap.
    /// Offered oldest-due first, ties broken by id. Rows being claimed by a
    /// concurrent caller are skipped, never waited on.
    async fn claim(
        &self,
        capacity: usize,
        lease: &LeasePolicy,
        retry: &RetryPolicy,
    ) -> Result<Vec<ClaimedItem>, QueueError>;

    /// Idempotent. Unknown id is [`QueueError::NotFound`].
    async fn ack(&self, receipt: &Receipt) -> Result<Settlement, QueueError>;

    /// Idempotent; never double-increments `retry_count`.
    async fn nack(
        &self,
        receipt: &Receipt,
        error: &str,
        retry: &RetryPolicy,
    ) -> Result<Settlement, QueueError>;

    /// Reaper: apply the lease-expiry transition to every `processing` row
    /// whose lease ran out. The predicate is re-checked per row at write time.
    async fn reap_expired(&self, retry: &RetryPolicy) -> Result<u64, QueueError>;

    /// Flip `pending`/`processing` rows at or over the cap to `failed`.
    async fn enforce_retry_cap(&self, retry: &RetryPolicy) -> Result<u64, QueueError>;

    /// Fail `pending` rows created before `cutoff` (max-age fallback).
    async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Copy terminal rows with `posted_at < cutoff` to the archive, then delete
    /// them from the hot table. Safe to re-run after a crash between the steps.
    /// Returns the number of rows removed from the hot table.
    async fn archive_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Current time as the store sees it. Cutoffs are computed from this.
    async fn now(&self) -> Result<DateTime<Utc>, QueueError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError>;

    async fn archived(&self, id: WorkItemId) -> Result<Option<ArchiveRecord>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
