//! CleanupLoop - 終端状態の行を cold table へ退避
//!
//! # フロー
//! 1. （設定時）一度も claim されずに max age を超えた pending を failed に
//! 2. retry 上限チェック
//! 3. `posted_at < now - ttl` の sent / failed を archive にコピーしてから削除
//!
//! どのステップも冪等なので、途中でクラッシュしても次の tick でやり直せます。

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::queue::Queue;

pub struct CleanupLoop {
    queue: Queue,
    interval: Duration,
    ttl: Duration,
}

impl CleanupLoop {
    pub fn new(queue: Queue, interval: Duration, ttl: Duration) -> Self {
        Self {
            queue,
            interval,
            ttl,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, ttl = ?self.ttl, "cleanup started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.queue.cleanup(self.ttl).await {
                Ok(report) => tracing::info!(
                    expired = report.expired,
                    capped = report.capped,
                    archived = report.archived,
                    "cleanup finished"
                ),
                Err(e) => tracing::error!(error = %e, "cleanup failed"),
            }
        }

        tracing::info!("cleanup stopped");
    }
}
