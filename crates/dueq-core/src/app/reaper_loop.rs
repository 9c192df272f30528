//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. 一定間隔で `Queue::sweep()`（claim のトラフィックとは独立）
//! 2. 期限切れ lease を pending / failed に戻す（retry_count + 1）
//! 3. retry 上限を超えた行を failed に固定
//!
//! 失敗してもログを出して次の tick で再試行します。プロセスは落としません。

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::queue::Queue;

pub struct ReaperLoop {
    queue: Queue,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(queue: Queue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "reaper started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.queue.sweep().await {
                Ok(report) if report.reclaimed > 0 || report.capped > 0 => {
                    tracing::info!(
                        reclaimed = report.reclaimed,
                        capped = report.capped,
                        "sweep reclaimed items"
                    );
                }
                Ok(_) => tracing::debug!("sweep: nothing to reclaim"),
                Err(e) => tracing::error!(error = %e, "sweep failed"),
            }
        }

        tracing::info!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemStatus, LeasePolicy, NewWorkItem, PayloadRef, RetryPolicy};
    use crate::impls::InMemoryWorkStore;
    use crate::ports::{Clock, ManualClock, UlidGenerator};
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::sync::Arc;

    #[tokio::test]
    async fn reaper_sweeps_on_its_first_tick_and_stops_on_shutdown() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let store = InMemoryWorkStore::new(
            Arc::new(clock.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
        );
        let queue = Queue::new(Arc::new(store))
            .with_lease(LeasePolicy::new(Duration::from_secs(60)))
            .with_retry(RetryPolicy::default());
        let id = queue
            .enqueue(NewWorkItem::new(PayloadRef::new("a", "o"), clock.now()))
            .await
            .unwrap();
        queue.claim(1).await.unwrap();
        clock.advance(TimeDelta::seconds(61));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(ReaperLoop::new(queue.clone(), Duration::from_secs(3600)).run(rx));

        let mut reclaimed = false;
        for _ in 0..100 {
            if queue.get(id).await.unwrap().unwrap().status == ItemStatus::Pending {
                reclaimed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reclaimed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
