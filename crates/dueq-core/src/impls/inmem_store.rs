//! InMemoryWorkStore - テスト・単一プロセス用の WorkStore 実装
//!
//! 全状態を一つの `tokio::sync::Mutex` で保護します。ロックを取った区間が
//! そのまま「行単位の atomic な read-modify-write」になるので、claim の
//! skip-locked 相当は自明に満たされます（競合する claim は直列化されるだけ）。
//!
//! 状態遷移は全て `WorkItem` のメソッドに委譲し、ここでは選択と保存だけを行います。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::QueueCounts;
use crate::domain::{
    ArchiveRecord, ItemStatus, LeasePolicy, NewWorkItem, QueueError, RetryPolicy, Settlement,
    WorkItem, WorkItemId,
};
use crate::ports::{Clock, ClaimedItem, IdGenerator, Receipt, WorkStore};

#[derive(Default)]
struct InMemoryState {
    /// Hot table.
    items: HashMap<WorkItemId, WorkItem>,
    /// Cold table, append-only.
    archive: HashMap<WorkItemId, ArchiveRecord>,
}

impl InMemoryState {
    fn has_uncompleted(&self, subject_id: &str) -> bool {
        self.items
            .values()
            .any(|item| !item.status.is_terminal() && item.payload_ref.subject_id == subject_id)
    }

    fn item_mut(&mut self, id: WorkItemId) -> Result<&mut WorkItem, QueueError> {
        self.items.get_mut(&id).ok_or(QueueError::NotFound(id))
    }

    /// First half of archival. Ids already in the archive keep their first copy.
    fn copy_terminal(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let mut copied = 0;
        for item in self.items.values().filter(|i| i.is_archivable(cutoff)) {
            if !self.archive.contains_key(&item.id) {
                self.archive
                    .insert(item.id, ArchiveRecord::new(item.clone(), now));
                copied += 1;
            }
        }
        copied
    }

    /// Second half of archival. Only rows that already have an archive copy go.
    fn delete_archived(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let doomed: Vec<WorkItemId> = self
            .items
            .values()
            .filter(|i| i.is_archivable(cutoff) && self.archive.contains_key(&i.id))
            .map(|i| i.id)
            .collect();
        for id in &doomed {
            self.items.remove(id);
        }
        doomed.len() as u64
    }
}

pub struct InMemoryWorkStore {
    state: Arc<Mutex<InMemoryState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryWorkStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            clock,
            ids,
        }
    }

    /// Run only the copy step of archival, as if the process died before the
    /// delete. Returns how many new archive rows were written.
    pub async fn copy_terminal_only(&self, cutoff: DateTime<Utc>) -> usize {
        let now = self.clock.now();
        self.state.lock().await.copy_terminal(cutoff, now)
    }

    /// Overwrite a row as-is. Lets tests model out-of-band edits such as a
    /// lowered retry cap or a hand-edited status.
    pub async fn put_raw(&self, item: WorkItem) {
        self.state.lock().await.items.insert(item.id, item);
    }

    pub async fn archive_len(&self) -> usize {
        self.state.lock().await.archive.len()
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItemId, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.has_uncompleted(&new.payload_ref.subject_id) {
            return Err(QueueError::DuplicateWorkItem {
                subject_id: new.payload_ref.subject_id,
            });
        }
        let id = self.ids.generate_item_id();
        state.items.insert(id, WorkItem::new(id, new, now));
        Ok(id)
    }

    async fn claim(
        &self,
        capacity: usize,
        lease: &LeasePolicy,
        retry: &RetryPolicy,
    ) -> Result<Vec<ClaimedItem>, QueueError> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let token = self.ids.generate_lease_token();
        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, WorkItemId)> = state
            .items
            .values()
            .filter(|item| item.is_claimable(now, retry))
            .map(|item| (item.scheduled_for, item.id))
            .collect();
        due.sort_unstable();
        due.truncate(capacity);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            let item = state.item_mut(id)?;
            item.claim(token, now, lease);
            claimed.push(ClaimedItem {
                item: item.clone(),
                token,
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<Settlement, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.item_mut(receipt.id)?.ack(receipt.token, now))
    }

    async fn nack(
        &self,
        receipt: &Receipt,
        error: &str,
        retry: &RetryPolicy,
    ) -> Result<Settlement, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state
            .item_mut(receipt.id)?
            .nack(receipt.token, error, now, retry))
    }

    async fn reap_expired(&self, retry: &RetryPolicy) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let reaped = state
            .items
            .values_mut()
            .filter_map(|item| item.expire_lease(now, retry).then_some(()))
            .count();
        Ok(reaped as u64)
    }

    async fn enforce_retry_cap(&self, retry: &RetryPolicy) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let capped = state
            .items
            .values_mut()
            .filter_map(|item| item.enforce_retry_cap(now, retry).then_some(()))
            .count();
        Ok(capped as u64)
    }

    async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let expired = state
            .items
            .values_mut()
            .filter_map(|item| item.expire_unclaimed(now, cutoff).then_some(()))
            .count();
        Ok(expired as u64)
    }

    async fn archive_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.copy_terminal(cutoff, now);
        Ok(state.delete_archived(cutoff))
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        Ok(self.clock.now())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn archived(&self, id: WorkItemId) -> Result<Option<ArchiveRecord>, QueueError> {
        Ok(self.state.lock().await.archive.get(&id).cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for item in state.items.values() {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Sent => counts.sent += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts.archived = state.archive.len() as u64;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PayloadRef, SettlementKind};
    use crate::ports::{ManualClock, UlidGenerator};
    use chrono::{TimeDelta, TimeZone};
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn store() -> (InMemoryWorkStore, ManualClock) {
        let clock = ManualClock::new(start());
        let ids = UlidGenerator::new(clock.clone());
        let store = InMemoryWorkStore::new(Arc::new(clock.clone()), Arc::new(ids));
        (store, clock)
    }

    fn new_item(subject: &str, at: DateTime<Utc>) -> NewWorkItem {
        NewWorkItem::new(PayloadRef::new(subject, "owner-1"), at)
    }

    fn lease_60s() -> LeasePolicy {
        LeasePolicy::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn enqueue_rejects_second_uncompleted_item_for_subject() {
        let (store, _) = store();
        store.enqueue(new_item("todo-1", start())).await.unwrap();

        let err = store.enqueue(new_item("todo-1", start())).await.unwrap_err();

        assert!(matches!(err, QueueError::DuplicateWorkItem { subject_id } if subject_id == "todo-1"));
    }

    #[tokio::test]
    async fn enqueue_allows_subject_again_once_terminal() {
        let (store, _) = store();
        let retry = RetryPolicy::default();
        store.enqueue(new_item("todo-1", start())).await.unwrap();
        let claimed = store.claim(1, &lease_60s(), &retry).await.unwrap();
        store.ack(&claimed[0].receipt()).await.unwrap();

        assert!(store.enqueue(new_item("todo-1", start())).await.is_ok());
    }

    #[tokio::test]
    async fn claim_returns_oldest_due_first_and_skips_future_items() {
        let (store, _) = store();
        let retry = RetryPolicy::default();
        let later = store
            .enqueue(new_item("b", start() - TimeDelta::seconds(10)))
            .await
            .unwrap();
        let earlier = store
            .enqueue(new_item("a", start() - TimeDelta::seconds(20)))
            .await
            .unwrap();
        store
            .enqueue(new_item("future", start() + TimeDelta::hours(1)))
            .await
            .unwrap();

        let claimed = store.claim(10, &lease_60s(), &retry).await.unwrap();

        let ids: Vec<_> = claimed.iter().map(|c| c.item.id).collect();
        assert_eq!(ids, vec![earlier, later]);
        assert!(claimed.iter().all(|c| c.item.status == ItemStatus::Processing));
        assert_eq!(
            claimed[0].item.lease_expires_at,
            Some(start() + TimeDelta::seconds(60))
        );
    }

    #[tokio::test]
    async fn claim_ties_are_broken_by_id() {
        let (store, clock) = store();
        let retry = RetryPolicy::default();
        let first = store.enqueue(new_item("a", start())).await.unwrap();
        clock.advance(TimeDelta::milliseconds(5));
        let second = store.enqueue(new_item("b", start())).await.unwrap();

        let claimed = store.claim(1, &lease_60s(), &retry).await.unwrap();

        assert!(first < second);
        assert_eq!(claimed[0].item.id, first);
    }

    #[tokio::test]
    async fn claim_with_zero_capacity_claims_nothing() {
        let (store, _) = store();
        store.enqueue(new_item("a", start())).await.unwrap();

        let claimed = store
            .claim(0, &lease_60s(), &RetryPolicy::default())
            .await
            .unwrap();

        assert!(claimed.is_empty());
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn ack_and_nack_on_unknown_id_are_not_found() {
        let (store, _) = store();
        let ids = UlidGenerator::new(ManualClock::new(start()));
        let receipt = Receipt {
            id: ids.generate_item_id(),
            token: ids.generate_lease_token(),
        };

        assert!(matches!(
            store.ack(&receipt).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            store.nack(&receipt, "boom", &RetryPolicy::default()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_receipt_after_reap_reports_lease_lost() {
        let (store, clock) = store();
        let retry = RetryPolicy::default();
        store.enqueue(new_item("a", start())).await.unwrap();
        let first = store.claim(1, &lease_60s(), &retry).await.unwrap();

        clock.advance(TimeDelta::seconds(61));
        assert_eq!(store.reap_expired(&retry).await.unwrap(), 1);
        let second = store.claim(1, &lease_60s(), &retry).await.unwrap();
        assert_eq!(second[0].item.id, first[0].item.id);

        let late_nack = store
            .nack(&first[0].receipt(), "late", &retry)
            .await
            .unwrap();
        assert_eq!(late_nack.kind, SettlementKind::LeaseLost);
        assert_eq!(late_nack.retry_count, 1);

        let current = store.ack(&second[0].receipt()).await.unwrap();
        assert_eq!(current.kind, SettlementKind::Applied);
        assert_eq!(current.status, ItemStatus::Sent);
    }

    #[tokio::test]
    async fn archive_after_interrupted_copy_keeps_one_copy() {
        let (store, clock) = store();
        let retry = RetryPolicy::default();
        let id = store.enqueue(new_item("a", start())).await.unwrap();
        let claimed = store.claim(1, &lease_60s(), &retry).await.unwrap();
        store.ack(&claimed[0].receipt()).await.unwrap();

        clock.advance(TimeDelta::days(31));
        let cutoff = clock.now() - TimeDelta::days(30);
        assert_eq!(store.copy_terminal_only(cutoff).await, 1);
        assert!(store.get(id).await.unwrap().is_some());

        assert_eq!(store.archive_terminal(cutoff).await.unwrap(), 1);
        assert_eq!(store.archive_len().await, 1);
        assert!(store.get(id).await.unwrap().is_none());
        let record = store.archived(id).await.unwrap().unwrap();
        assert_eq!(record.item.status, ItemStatus::Sent);
    }

    #[tokio::test]
    async fn counts_cover_every_status_and_the_archive() {
        let (store, _) = store();
        let retry = RetryPolicy::immediate(1);
        store.enqueue(new_item("a", start())).await.unwrap();
        store.enqueue(new_item("b", start())).await.unwrap();
        store.enqueue(new_item("c", start())).await.unwrap();
        store.enqueue(new_item("d", start() + TimeDelta::hours(1))).await.unwrap();
        let claimed = store.claim(3, &lease_60s(), &retry).await.unwrap();
        store.ack(&claimed[0].receipt()).await.unwrap();
        store.nack(&claimed[1].receipt(), "boom", &retry).await.unwrap();

        let counts = store.counts().await.unwrap();

        assert_eq!(
            counts,
            QueueCounts {
                pending: 1,
                processing: 1,
                sent: 1,
                failed: 1,
                archived: 0,
            }
        );
    }
}
