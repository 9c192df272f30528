//! Queue - producer / worker / 定期ジョブが使う唯一の入口
//!
//! WorkStore に lease / retry の方針を束ね、enqueue 成功時の wake 通知を担います。
//! 状態は持たないので `Clone` して各ループに配ります。

use std::sync::Arc;
use std::time::Duration;

use crate::app::status::{CleanupReport, QueueCounts, SweepReport};
use crate::config::QueueConfig;
use crate::domain::policy::sub_duration;
use crate::domain::{
    LeasePolicy, NewWorkItem, QueueError, RetryPolicy, Settlement, WorkItem, WorkItemId,
};
use crate::ports::{ClaimedItem, Receipt, WakeSignal, WorkStore};

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn WorkStore>,
    wake: Option<Arc<dyn WakeSignal>>,
    lease: LeasePolicy,
    retry: RetryPolicy,
    max_pending_age: Option<Duration>,
}

impl Queue {
    /// Default lease and retry policy, no wake channel.
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self {
            store,
            wake: None,
            lease: LeasePolicy::default(),
            retry: RetryPolicy::default(),
            max_pending_age: None,
        }
    }

    pub fn from_config(store: Arc<dyn WorkStore>, config: &QueueConfig) -> Self {
        Self::new(store)
            .with_lease(config.lease_policy())
            .with_retry(config.retry_policy())
            .with_max_pending_age(config.max_pending_age())
    }

    pub fn with_wake(mut self, wake: Arc<dyn WakeSignal>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn with_lease(mut self, lease: LeasePolicy) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_pending_age(mut self, age: Option<Duration>) -> Self {
        self.max_pending_age = age;
        self
    }

    pub fn lease(&self) -> &LeasePolicy {
        &self.lease
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn wake(&self) -> Option<&Arc<dyn WakeSignal>> {
        self.wake.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    /// Insert a pending item and wake idle workers.
    pub async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItemId, QueueError> {
        let subject_id = new.payload_ref.subject_id.clone();
        let scheduled_for = new.scheduled_for;
        let id = self.store.enqueue(new).await?;
        tracing::info!(item_id = %id, %subject_id, %scheduled_for, "enqueued");
        self.notify().await;
        Ok(id)
    }

    /// Manual wake, e.g. after a bulk import straight into the table.
    pub async fn notify(&self) {
        if let Some(wake) = &self.wake {
            wake.notify().await;
        }
    }

    pub async fn claim(&self, capacity: usize) -> Result<Vec<ClaimedItem>, QueueError> {
        self.store.claim(capacity, &self.lease, &self.retry).await
    }

    /// Claim with a one-off lease duration instead of the configured one.
    pub async fn claim_with_lease(
        &self,
        capacity: usize,
        lease: &LeasePolicy,
    ) -> Result<Vec<ClaimedItem>, QueueError> {
        self.store.claim(capacity, lease, &self.retry).await
    }

    pub async fn ack(&self, receipt: &Receipt) -> Result<Settlement, QueueError> {
        self.store.ack(receipt).await
    }

    pub async fn nack(&self, receipt: &Receipt, error: &str) -> Result<Settlement, QueueError> {
        self.store.nack(receipt, error, &self.retry).await
    }

    /// Reaper pass followed by the retry-cap check.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let reclaimed = self.store.reap_expired(&self.retry).await?;
        let capped = self.store.enforce_retry_cap(&self.retry).await?;
        Ok(SweepReport { reclaimed, capped })
    }

    /// Retire terminal rows older than `ttl` into the archive.
    ///
    /// Runs the max-age fallback (when configured) and the retry-cap check
    /// first, so rows they terminate start their ttl clock now.
    pub async fn cleanup(&self, ttl: Duration) -> Result<CleanupReport, QueueError> {
        let now = self.store.now().await?;
        let expired = match self.max_pending_age {
            Some(age) => self.store.expire_stale(sub_duration(now, age)).await?,
            None => 0,
        };
        let capped = self.store.enforce_retry_cap(&self.retry).await?;
        let archived = self.store.archive_terminal(sub_duration(now, ttl)).await?;
        Ok(CleanupReport {
            expired,
            capped,
            archived,
        })
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.store.counts().await
    }

    pub async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        self.store.get(id).await
    }
}
