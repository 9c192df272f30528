//! Policy - lease と retry/dead-letter の判断ロジック
//!
//! どちらも純粋な値オブジェクトで、時刻は呼び出し側から渡します。

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// LeasePolicy - visibility timeout の契約
///
/// タイマーは持ちません。claim 時に [`LeasePolicy::expires_at`] で
/// `lease_expires_at` を刻み、Reaper がそれと比較します。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeasePolicy {
    pub duration: Duration,
}

impl LeasePolicy {
    /// Soft execution timeout as a fraction of the lease.
    const SOFT_TIMEOUT_RATIO: f64 = 0.8;

    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add_duration(now, self.duration)
    }

    /// Workers abandon the side effect after this long and nack, so they
    /// settle before the Reaper can hand the item to someone else.
    pub fn soft_timeout(&self) -> Duration {
        self.duration.mul_f64(Self::SOFT_TIMEOUT_RATIO)
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// RetryPolicy - retry / dead-letter の判断
///
/// # 学習ポイント
/// - `retry_count` は失敗回数（nack と lease 切れ）
/// - `retry_count >= max_retry` で `failed` に凍結し、二度と claim されない
/// - backoff は指数（上限あり）
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retry: u32,

    /// Delay after the first failure is `base_delay * multiplier`.
    pub base_delay: Duration,

    /// Upper bound on any single backoff.
    pub max_delay: Duration,

    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// No delay between attempts. Handy in tests.
    pub fn immediate(max_retry: u32) -> Self {
        Self {
            max_retry,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retry
    }

    /// Backoff before the item becomes claimable again.
    ///
    /// `retry_count` is the value *after* the increment for this failure:
    /// delay = min(base_delay * multiplier^retry_count, max_delay)
    ///
    /// base=60s, multiplier=2.0, max=3600s:
    /// - retry 1: 120s
    /// - retry 2: 240s
    /// - retry 5: 1920s
    /// - retry 6: 3600s (capped)
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// When a nacked item becomes claimable again.
    pub fn next_eligible_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        add_duration(now, self.backoff(retry_count))
    }
}

/// `at + d`, saturating at the end of representable time.
pub(crate) fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, saturating at the start of representable time.
pub(crate) fn sub_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn default_policy_matches_worker_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retry, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(60));
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
    }

    #[rstest]
    #[case::first_failure(1, 120)]
    #[case::second_failure(2, 240)]
    #[case::third_failure(3, 480)]
    #[case::fifth_failure(5, 1920)]
    #[case::capped(6, 3600)]
    #[case::far_past_cap(40, 3600)]
    fn exponential_backoff_is_capped(#[case] retry_count: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(retry_count), Duration::from_secs(expected_secs));
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::ZERO);
    }

    #[rstest]
    #[case(0, false)]
    #[case(2, false)]
    #[case(3, true)]
    #[case(4, true)]
    fn exhaustion_is_inclusive_of_cap(#[case] retry_count: u32, #[case] exhausted: bool) {
        let policy = RetryPolicy::default().with_max_retry(3);
        assert_eq!(policy.is_exhausted(retry_count), exhausted);
    }

    #[test]
    fn lease_expiry_and_soft_timeout() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let lease = LeasePolicy::new(Duration::from_secs(60));

        assert_eq!(lease.expires_at(now), now + TimeDelta::seconds(60));
        assert_eq!(lease.soft_timeout(), Duration::from_secs(48));
        assert!(lease.soft_timeout() < lease.duration);
    }
}
