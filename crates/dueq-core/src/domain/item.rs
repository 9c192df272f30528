//! WorkItem - キューの唯一の永続状態と、その状態機械
//!
//! # 学習ポイント
//! - 状態遷移は `WorkItem` の純粋なメソッド（`now` は呼び出し側から渡す）
//! - ストアは行を読み、遷移を一つ適用して書き戻すだけ
//! - `retry_count` は単調増加。上限に達した item は `failed` で凍結

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{LeaseToken, WorkItemId};
use super::policy::{LeasePolicy, RetryPolicy};
use super::settlement::{Settlement, SettlementKind};

/// Stored `error` is cut to this many characters.
pub const MAX_ERROR_LEN: usize = 512;

pub const LEASE_EXPIRED_ERROR: &str = "lease expired before ack/nack";
pub const RETRY_CAP_ERROR: &str = "max retries exceeded";
pub const STALE_PENDING_ERROR: &str = "expired: never claimed within max pending age";

/// Work item の状態
///
/// 状態遷移:
/// - Pending -> Processing (claim)
/// - Processing -> Sent (ack)
/// - Processing -> Pending | Failed (nack, lease expiry)
/// - Pending | Processing -> Failed (retry-cap sweep, max-age fallback)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Sent => "sent",
            ItemStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Sent | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "processing" => Ok(ItemStatus::Processing),
            "sent" => Ok(ItemStatus::Sent),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// What the work is about: the subject (e.g. a todo) and the actor owning it.
///
/// At most one uncompleted item may exist per `subject_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef {
    pub subject_id: String,
    pub owner_id: String,
}

impl PayloadRef {
    pub fn new(subject_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            owner_id: owner_id.into(),
        }
    }
}

/// Enqueue の入力（producer が組み立てる）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub payload_ref: PayloadRef,
    pub scheduled_for: DateTime<Utc>,
    /// Opaque data handed to the side effect.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewWorkItem {
    pub fn new(payload_ref: PayloadRef, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            payload_ref,
            scheduled_for,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// WorkItem は一件の at-least-once な仕事
///
/// 不変条件は [`WorkItem::check_invariants`] を参照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub payload_ref: PayloadRef,
    pub payload: serde_json::Value,

    /// Eligible for claim once `scheduled_for <= now`. Pushed forward by backoff.
    pub scheduled_for: DateTime<Utc>,
    pub status: ItemStatus,

    /// Set iff `status == Processing`.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Token of the claim currently holding the lease.
    pub lease_token: Option<LeaseToken>,

    /// Failed attempts so far (nacks and expired leases). Never decreases.
    pub retry_count: u32,
    pub error: Option<String>,

    /// When the item reached `sent` or `failed`.
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(id: WorkItemId, new: NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload_ref: new.payload_ref,
            payload: new.payload,
            scheduled_for: new.scheduled_for,
            status: ItemStatus::Pending,
            lease_expires_at: None,
            lease_token: None,
            retry_count: 0,
            error: None,
            posted_at: None,
            created_at: now,
        }
    }

    /// Claim selection predicate. Exhausted items are never claimable,
    /// whatever their status says.
    pub fn is_claimable(&self, now: DateTime<Utc>, retry: &RetryPolicy) -> bool {
        self.status == ItemStatus::Pending
            && self.scheduled_for <= now
            && !retry.is_exhausted(self.retry_count)
    }

    pub fn is_archivable(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.posted_at.is_some_and(|at| at < cutoff)
    }

    pub fn holds_lease(&self, token: LeaseToken) -> bool {
        self.status == ItemStatus::Processing && self.lease_token == Some(token)
    }

    /// pending -> processing
    pub fn claim(&mut self, token: LeaseToken, now: DateTime<Utc>, lease: &LeasePolicy) {
        debug_assert_eq!(self.status, ItemStatus::Pending);
        self.status = ItemStatus::Processing;
        self.lease_expires_at = Some(lease.expires_at(now));
        self.lease_token = Some(token);
    }

    /// processing -> sent
    ///
    /// A lost lease still marks the item sent: the side effect did happen,
    /// and leaving it pending would only cause another duplicate.
    pub fn ack(&mut self, token: LeaseToken, now: DateTime<Utc>) -> Settlement {
        let kind = match self.status {
            ItemStatus::Sent | ItemStatus::Failed => SettlementKind::AlreadyTerminal,
            _ if self.holds_lease(token) => {
                self.mark_sent(now);
                SettlementKind::Applied
            }
            ItemStatus::Pending | ItemStatus::Processing => {
                self.mark_sent(now);
                SettlementKind::LeaseLost
            }
        };
        self.settlement(kind)
    }

    /// processing -> pending (with backoff) | failed
    ///
    /// A nack from a lost lease changes nothing: the Reaper already counted
    /// that attempt when it reclaimed the item.
    pub fn nack(
        &mut self,
        token: LeaseToken,
        error: &str,
        now: DateTime<Utc>,
        retry: &RetryPolicy,
    ) -> Settlement {
        let kind = match self.status {
            ItemStatus::Sent | ItemStatus::Failed => SettlementKind::AlreadyTerminal,
            _ if self.holds_lease(token) => {
                self.record_failure(error, now, retry, true);
                SettlementKind::Applied
            }
            ItemStatus::Pending | ItemStatus::Processing => SettlementKind::LeaseLost,
        };
        self.settlement(kind)
    }

    /// Reaper transition. Re-checks the predicate itself, so a row acked or
    /// nacked after it was selected is left alone.
    pub fn expire_lease(&mut self, now: DateTime<Utc>, retry: &RetryPolicy) -> bool {
        let expired = self.status == ItemStatus::Processing
            && self.lease_expires_at.is_some_and(|at| at < now);
        if expired {
            self.record_failure(LEASE_EXPIRED_ERROR, now, retry, false);
        }
        expired
    }

    /// Retry-cap sweep. No-op when the invariants already hold.
    pub fn enforce_retry_cap(&mut self, now: DateTime<Utc>, retry: &RetryPolicy) -> bool {
        let over_cap = !self.status.is_terminal() && retry.is_exhausted(self.retry_count);
        if over_cap {
            self.mark_failed(RETRY_CAP_ERROR, now);
        }
        over_cap
    }

    /// Max-age fallback for items that were never claimed.
    pub fn expire_unclaimed(&mut self, now: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
        let stale = self.status == ItemStatus::Pending && self.created_at < cutoff;
        if stale {
            self.mark_failed(STALE_PENDING_ERROR, now);
        }
        stale
    }

    /// Returns the first violated data-model invariant, if any.
    pub fn check_invariants(&self, retry: &RetryPolicy) -> Result<(), String> {
        match self.status {
            ItemStatus::Processing if self.lease_expires_at.is_none() => {
                Err(format!("{}: processing without lease", self.id))
            }
            ItemStatus::Sent | ItemStatus::Failed if self.posted_at.is_none() => {
                Err(format!("{}: terminal without posted_at", self.id))
            }
            ItemStatus::Sent | ItemStatus::Failed if self.lease_expires_at.is_some() => {
                Err(format!("{}: terminal with a lease", self.id))
            }
            ItemStatus::Pending if retry.is_exhausted(self.retry_count) => {
                Err(format!("{}: pending past the retry cap", self.id))
            }
            _ => Ok(()),
        }
    }

    fn record_failure(
        &mut self,
        error: &str,
        now: DateTime<Utc>,
        retry: &RetryPolicy,
        backoff: bool,
    ) {
        self.retry_count = self.retry_count.saturating_add(1);
        if retry.is_exhausted(self.retry_count) {
            self.mark_failed(error, now);
            return;
        }
        self.status = ItemStatus::Pending;
        self.clear_lease();
        self.error = Some(truncate_error(error));
        if backoff {
            self.scheduled_for = retry.next_eligible_at(now, self.retry_count);
        }
    }

    fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Sent;
        self.clear_lease();
        self.error = None;
        self.posted_at = Some(now);
    }

    fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Failed;
        self.clear_lease();
        self.error = Some(truncate_error(error));
        self.posted_at = Some(now);
    }

    fn clear_lease(&mut self) {
        self.lease_expires_at = None;
        self.lease_token = None;
    }

    fn settlement(&self, kind: SettlementKind) -> Settlement {
        Settlement {
            id: self.id,
            kind,
            status: self.status,
            retry_count: self.retry_count,
        }
    }
}

/// Cut to [`MAX_ERROR_LEN`] characters, never splitting a code point.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((byte_idx, _)) => error[..byte_idx].to_string(),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use rstest::rstest;
    use std::time::Duration;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn token() -> LeaseToken {
        LeaseToken::from_ulid(Ulid::new())
    }

    fn item() -> WorkItem {
        let new = NewWorkItem::new(PayloadRef::new("todo-1", "user-1"), t0());
        WorkItem::new(WorkItemId::from_ulid(Ulid::new()), new, t0())
    }

    fn lease() -> LeasePolicy {
        LeasePolicy::new(Duration::from_secs(60))
    }

    fn claimed(tok: LeaseToken) -> WorkItem {
        let mut it = item();
        it.claim(tok, t0(), &lease());
        it
    }

    #[test]
    fn new_item_is_pending_and_claimable() {
        let it = item();
        assert_eq!(it.status, ItemStatus::Pending);
        assert_eq!(it.retry_count, 0);
        assert!(it.is_claimable(t0(), &RetryPolicy::default()));
        assert!(!it.is_claimable(t0() - TimeDelta::seconds(1), &RetryPolicy::default()));
    }

    #[test]
    fn claim_stamps_lease() {
        let tok = token();
        let it = claimed(tok);
        assert_eq!(it.status, ItemStatus::Processing);
        assert_eq!(it.lease_expires_at, Some(t0() + TimeDelta::seconds(60)));
        assert!(it.holds_lease(tok));
        it.check_invariants(&RetryPolicy::default()).unwrap();
    }

    #[test]
    fn ack_marks_sent_and_clears_lease() {
        let tok = token();
        let mut it = claimed(tok);
        let now = t0() + TimeDelta::seconds(5);

        let s = it.ack(tok, now);

        assert_eq!(s.kind, SettlementKind::Applied);
        assert_eq!(it.status, ItemStatus::Sent);
        assert_eq!(it.posted_at, Some(now));
        assert!(it.lease_expires_at.is_none());
        assert!(it.lease_token.is_none());
        it.check_invariants(&RetryPolicy::default()).unwrap();
    }

    #[test]
    fn second_ack_is_already_terminal() {
        let tok = token();
        let mut it = claimed(tok);
        it.ack(tok, t0());
        let before = it.clone();

        let s = it.ack(tok, t0() + TimeDelta::seconds(1));

        assert_eq!(s.kind, SettlementKind::AlreadyTerminal);
        assert_eq!(it, before);
    }

    #[test]
    fn nack_requeues_with_backoff() {
        let tok = token();
        let mut it = claimed(tok);
        let now = t0() + TimeDelta::seconds(10);

        let s = it.nack(tok, "slack down", now, &RetryPolicy::default());

        assert_eq!(s.kind, SettlementKind::Applied);
        assert_eq!(it.status, ItemStatus::Pending);
        assert_eq!(it.retry_count, 1);
        assert_eq!(it.error.as_deref(), Some("slack down"));
        assert_eq!(it.scheduled_for, now + TimeDelta::seconds(120));
        assert!(it.posted_at.is_none());
        assert!(it.lease_expires_at.is_none());
    }

    #[test]
    fn nack_at_cap_freezes_item() {
        let retry = RetryPolicy::immediate(1);
        let tok = token();
        let mut it = claimed(tok);

        let s = it.nack(tok, "boom", t0(), &retry);

        assert_eq!(s.status, ItemStatus::Failed);
        assert_eq!(it.posted_at, Some(t0()));
        assert!(!it.is_claimable(t0(), &retry));
        it.check_invariants(&retry).unwrap();
    }

    #[test]
    fn double_nack_does_not_double_increment() {
        let retry = RetryPolicy::immediate(1);
        let tok = token();
        let mut it = claimed(tok);

        it.nack(tok, "boom", t0(), &retry);
        let s = it.nack(tok, "boom again", t0(), &retry);

        assert_eq!(s.kind, SettlementKind::AlreadyTerminal);
        assert_eq!(it.retry_count, 1);
        assert_eq!(it.error.as_deref(), Some("boom"));
    }

    #[test]
    fn lease_expiry_counts_as_attempt() {
        let mut it = claimed(token());
        let retry = RetryPolicy::default();

        assert!(!it.expire_lease(t0() + TimeDelta::seconds(60), &retry));
        assert!(it.expire_lease(t0() + TimeDelta::seconds(61), &retry));

        assert_eq!(it.status, ItemStatus::Pending);
        assert_eq!(it.retry_count, 1);
        assert_eq!(it.scheduled_for, t0());
        assert_eq!(it.error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[test]
    fn lease_expiry_at_cap_fails() {
        let mut it = claimed(token());
        it.retry_count = 2;
        let retry = RetryPolicy::immediate(3);

        assert!(it.expire_lease(t0() + TimeDelta::seconds(61), &retry));
        assert_eq!(it.status, ItemStatus::Failed);
        assert_eq!(it.retry_count, 3);
    }

    #[test]
    fn late_ack_after_reclaim_is_lease_lost_but_sent() {
        let first = token();
        let mut it = claimed(first);
        it.expire_lease(t0() + TimeDelta::seconds(61), &RetryPolicy::default());

        let second = token();
        it.claim(second, t0() + TimeDelta::seconds(62), &lease());
        let s = it.ack(first, t0() + TimeDelta::seconds(63));

        assert_eq!(s.kind, SettlementKind::LeaseLost);
        assert_eq!(it.status, ItemStatus::Sent);
        assert_eq!(it.ack(second, t0()).kind, SettlementKind::AlreadyTerminal);
    }

    #[test]
    fn late_nack_after_reclaim_changes_nothing() {
        let first = token();
        let mut it = claimed(first);
        it.expire_lease(t0() + TimeDelta::seconds(61), &RetryPolicy::default());
        let before = it.clone();

        let s = it.nack(first, "too late", t0() + TimeDelta::seconds(62), &RetryPolicy::default());

        assert_eq!(s.kind, SettlementKind::LeaseLost);
        assert_eq!(it, before);
    }

    #[rstest]
    #[case::pending_over_cap(ItemStatus::Pending, 5, true)]
    #[case::processing_over_cap(ItemStatus::Processing, 7, true)]
    #[case::pending_under_cap(ItemStatus::Pending, 4, false)]
    #[case::sent(ItemStatus::Sent, 9, false)]
    #[case::failed(ItemStatus::Failed, 9, false)]
    fn retry_cap_sweep(#[case] status: ItemStatus, #[case] retry_count: u32, #[case] flips: bool) {
        let mut it = item();
        it.status = status;
        it.retry_count = retry_count;
        if status == ItemStatus::Processing {
            it.lease_expires_at = Some(t0() + TimeDelta::seconds(60));
        }
        if status.is_terminal() {
            it.posted_at = Some(t0());
        }

        let changed = it.enforce_retry_cap(t0(), &RetryPolicy::default());

        assert_eq!(changed, flips);
        if flips {
            assert_eq!(it.status, ItemStatus::Failed);
            assert_eq!(it.error.as_deref(), Some(RETRY_CAP_ERROR));
            assert_eq!(it.retry_count, retry_count);
            it.check_invariants(&RetryPolicy::default()).unwrap();
        } else {
            assert_eq!(it.status, status);
        }
    }

    #[test]
    fn unclaimed_items_expire_after_max_age() {
        let mut it = item();
        let cutoff = t0() + TimeDelta::days(1);

        assert!(it.expire_unclaimed(t0() + TimeDelta::days(2), cutoff));
        assert_eq!(it.status, ItemStatus::Failed);
        assert_eq!(it.error.as_deref(), Some(STALE_PENDING_ERROR));

        let mut fresh = item();
        assert!(!fresh.expire_unclaimed(t0(), t0()));
    }

    #[test]
    fn archivable_only_when_terminal_and_old() {
        let tok = token();
        let mut it = claimed(tok);
        assert!(!it.is_archivable(t0() + TimeDelta::days(31)));

        it.ack(tok, t0());
        assert!(!it.is_archivable(t0()));
        assert!(it.is_archivable(t0() + TimeDelta::seconds(1)));
    }

    #[test]
    fn error_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_ERROR_LEN + 10);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::Processing,
            ItemStatus::Sent,
            ItemStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("dead".parse::<ItemStatus>().is_err());
    }
}
