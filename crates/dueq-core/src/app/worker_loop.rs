//! WorkerLoop - claim → execute → ack/nack のポーリングループ
//!
//! # フロー
//! 1. `Queue::claim(batch_size)` で lease を取得
//! 2. 各 item の SideEffect を並行実行（lease の soft timeout 付き）
//! 3. 成功なら ack、失敗・タイムアウトなら nack
//! 4. 次の claim まで待つ（wake 通知 or adaptive poll interval のどちらか早い方）
//!
//! worker 同士はストア以外で調整しません。wake 通知が無くてもポーリングで動きます。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::app::queue::Queue;
use crate::config::QueueConfig;
use crate::domain::{QueueError, Settlement};
use crate::ports::{ClaimedItem, SideEffect, WakeListener};

/// Error recorded when a side effect overruns the soft timeout.
pub const EXECUTION_TIMEOUT_ERROR: &str = "execution timed out";

/// Adaptive poll interval.
///
/// - 2 consecutive empty batches: interval × 1.5, up to `max`
/// - any claimed item or a wake event: back to `min`
/// - a full batch: claim again immediately to drain
#[derive(Debug, Clone, PartialEq)]
pub struct PollInterval {
    min: Duration,
    max: Duration,
    current: Duration,
    empty_streak: u32,
}

impl PollInterval {
    const GROWTH: f64 = 1.5;
    const EMPTY_BATCHES_BEFORE_GROWTH: u32 = 2;

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
            empty_streak: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.empty_streak = 0;
    }

    /// Feed the size of the last claim. `None` means claim again right away.
    pub fn observe(&mut self, claimed: usize, capacity: usize) -> Option<Duration> {
        if claimed == 0 {
            self.empty_streak = self.empty_streak.saturating_add(1);
            if self.empty_streak >= Self::EMPTY_BATCHES_BEFORE_GROWTH {
                self.current = self.current.mul_f64(Self::GROWTH).min(self.max);
            }
            return Some(self.current);
        }
        self.reset();
        if claimed >= capacity {
            None
        } else {
            Some(self.current)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_min: Duration,
    pub poll_max: Duration,
    /// Attempts for one ack/nack when the store reports a transient error.
    pub settle_attempts: u32,
    pub settle_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_min: config.poll_interval_min(),
            poll_max: config.poll_interval_max(),
            ..Self::default()
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_min: Duration::from_secs(5),
            poll_max: Duration::from_secs(43_200),
            settle_attempts: 3,
            settle_backoff: Duration::from_millis(200),
        }
    }
}

pub struct WorkerLoop {
    worker_id: usize,
    queue: Queue,
    executor: Arc<dyn SideEffect>,
    settings: WorkerSettings,
    poll: PollInterval,
}

impl WorkerLoop {
    pub fn new(
        worker_id: usize,
        queue: Queue,
        executor: Arc<dyn SideEffect>,
        settings: WorkerSettings,
    ) -> Self {
        let poll = PollInterval::new(settings.poll_min, settings.poll_max);
        Self {
            worker_id,
            queue,
            executor,
            settings,
            poll,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// A batch that is already executing is finished and settled first;
    /// shutdown only stops taking new leases.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let worker_id = self.worker_id;
        tracing::info!(worker = worker_id, "worker started");
        let mut listener = self.subscribe().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                _ = shutdown.changed() => break,
                claimed = self.queue.claim(self.settings.batch_size) => claimed,
            };

            let next_wait = match claimed {
                Ok(items) => {
                    let n = items.len();
                    if n > 0 {
                        tracing::debug!(worker = worker_id, count = n, "claimed batch");
                        self.process_batch(items).await;
                    }
                    self.poll.observe(n, self.settings.batch_size)
                }
                Err(e) => {
                    // Claim failures are retried on the next tick.
                    tracing::error!(worker = worker_id, error = %e, "claim failed");
                    Some(self.poll.current())
                }
            };

            let Some(wait) = next_wait else {
                continue;
            };

            if listener.is_none() {
                listener = self.subscribe().await;
            }
            let woke = match listener.as_mut() {
                Some(l) => tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = l.wait() => true,
                    _ = tokio::time::sleep(wait) => false,
                },
                None => tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(wait) => false,
                },
            };
            if woke {
                tracing::debug!(worker = worker_id, "woken");
                self.poll.reset();
            }
        }

        tracing::info!(worker = worker_id, "worker stopped");
    }

    async fn subscribe(&self) -> Option<Box<dyn WakeListener>> {
        let wake = self.queue.wake()?;
        match wake.listen().await {
            Ok(listener) => Some(listener),
            Err(e) => {
                tracing::warn!(worker = self.worker_id, error = %e, "wake listener unavailable; polling only");
                None
            }
        }
    }

    /// Execute every item of the batch concurrently so each one gets its
    /// full soft timeout, measured from the claim.
    pub async fn process_batch(&self, items: Vec<ClaimedItem>) {
        let soft_timeout = self.queue.lease().soft_timeout();
        let mut tasks = JoinSet::new();
        for claimed in items {
            let queue = self.queue.clone();
            let executor = Arc::clone(&self.executor);
            let settings = self.settings.clone();
            let worker_id = self.worker_id;
            tasks.spawn(async move {
                process_one(worker_id, &queue, executor.as_ref(), &settings, soft_timeout, claimed)
                    .await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                // The lease expires and the Reaper hands the item out again.
                tracing::error!(worker = self.worker_id, error = %e, "item task panicked");
            }
        }
    }
}

async fn process_one(
    worker_id: usize,
    queue: &Queue,
    executor: &dyn SideEffect,
    settings: &WorkerSettings,
    soft_timeout: Duration,
    claimed: ClaimedItem,
) {
    let receipt = &claimed.receipt();
    let item_id = receipt.id;

    let outcome = tokio::time::timeout(soft_timeout, executor.execute(&claimed.item)).await;
    let settled = match outcome {
        Ok(Ok(())) => with_store_retry(settings, "ack", move || queue.ack(receipt)).await,
        Ok(Err(e)) => {
            tracing::warn!(worker = worker_id, item_id = %item_id, error = %e, "side effect failed");
            let message = e.to_string();
            let message = message.as_str();
            with_store_retry(settings, "nack", move || queue.nack(receipt, message)).await
        }
        Err(_) => {
            tracing::warn!(worker = worker_id, item_id = %item_id, timeout = ?soft_timeout, "side effect timed out");
            with_store_retry(settings, "nack", move || {
                queue.nack(receipt, EXECUTION_TIMEOUT_ERROR)
            })
            .await
        }
    };

    match settled {
        Ok(settlement) => log_settlement(worker_id, &settlement),
        Err(e) => {
            // Unsettled: the lease runs out and the Reaper counts the attempt.
            tracing::error!(worker = worker_id, item_id = %item_id, error = %e, "settle failed");
        }
    }
}

fn log_settlement(worker_id: usize, settlement: &Settlement) {
    match settlement.warning() {
        Some(warning) => {
            tracing::warn!(worker = worker_id, item_id = %settlement.id, status = %settlement.status, "{warning}")
        }
        None => tracing::info!(
            worker = worker_id,
            item_id = %settlement.id,
            status = %settlement.status,
            retry_count = settlement.retry_count,
            "settled"
        ),
    }
}

/// Retry `op` with doubling delay while the store error is transient.
async fn with_store_retry<T, F, Fut>(
    settings: &WorkerSettings,
    operation: &str,
    mut op: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut delay = settings.settle_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < settings.settle_attempts => {
                tracing::debug!(operation, attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            result => return result,
        }
    }
}
