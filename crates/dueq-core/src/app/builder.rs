//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - graceful shutdown（watch channel で全ループに停止を伝える）

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::cleanup_loop::CleanupLoop;
use crate::app::queue::Queue;
use crate::app::reaper_loop::ReaperLoop;
use crate::app::worker_loop::{WorkerLoop, WorkerSettings};
use crate::config::QueueConfig;
use crate::domain::QueueError;
use crate::ports::{SideEffect, WakeSignal, WorkStore};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .store(Arc::new(store))
///     .wake(Arc::new(PgNotifyWake::new(pool, "reminder_pending")))
///     .executor(Arc::new(SlackPost::new(token)))
///     .config(QueueConfig::from_env()?)
///     .build()?;
/// let handle = app.spawn();
/// // ...
/// handle.shutdown_and_join().await;
/// ```
///
/// # Fail-fast 設計
/// - store / executor が無ければ BuildError
/// - config.validate() が通らなければ BuildError
pub struct AppBuilder {
    store: Option<Arc<dyn WorkStore>>,
    wake: Option<Arc<dyn WakeSignal>>,
    executor: Option<Arc<dyn SideEffect>>,
    config: QueueConfig,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No work store configured. Call AppBuilder::store() before build().")]
    MissingStore,

    #[error("No side effect configured. Call AppBuilder::executor() before build().")]
    MissingExecutor,

    #[error(transparent)]
    InvalidConfig(#[from] QueueError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            wake: None,
            executor: None,
            config: QueueConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn WorkStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Optional. Without it workers rely on polling alone.
    pub fn wake(mut self, wake: Arc<dyn WakeSignal>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn SideEffect>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let executor = self.executor.ok_or(BuildError::MissingExecutor)?;

        let mut queue = Queue::from_config(store, &self.config);
        if let Some(wake) = self.wake {
            queue = queue.with_wake(wake);
        }
        Ok(App {
            queue,
            executor,
            config: self.config,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は配線済みのキュー一式
pub struct App {
    queue: Queue,
    executor: Arc<dyn SideEffect>,
    config: QueueConfig,
}

impl App {
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Spawn `config.workers` worker loops plus one reaper and one cleanup loop.
    pub fn spawn(self) -> AppHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(self.config.workers + 2);

        let settings = WorkerSettings::from_config(&self.config);
        for worker_id in 0..self.config.workers {
            let worker = WorkerLoop::new(
                worker_id,
                self.queue.clone(),
                Arc::clone(&self.executor),
                settings.clone(),
            );
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        let reaper = ReaperLoop::new(self.queue.clone(), self.config.sweep_interval());
        joins.push(tokio::spawn(reaper.run(shutdown_rx.clone())));

        let cleanup = CleanupLoop::new(
            self.queue.clone(),
            self.config.cleanup_interval(),
            self.config.ttl(),
        );
        joins.push(tokio::spawn(cleanup.run(shutdown_rx)));

        tracing::info!(workers = self.config.workers, "dueq started");
        AppHandle {
            queue: self.queue,
            shutdown_tx,
            joins,
        }
    }
}

/// Running app handle.
/// - `shutdown_tx` を drop するとループ全体が止まる
/// - `shutdown_and_join()` で全ループの終了を待てる
pub struct AppHandle {
    queue: Queue,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl AppHandle {
    /// The queue the loops run against, for producers in the same process.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Stop taking new leases. In-flight batches still finish and settle.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                tracing::error!(error = %e, "loop task ended abnormally");
            }
        }
        tracing::info!("dueq stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryWorkStore;
    use crate::ports::{ExecutionError, SystemClock, UlidGenerator};
    use crate::domain::WorkItem;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl SideEffect for Noop {
        async fn execute(&self, _item: &WorkItem) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn store() -> Arc<dyn WorkStore> {
        Arc::new(InMemoryWorkStore::new(
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        ))
    }

    #[test]
    fn build_requires_a_store() {
        let app = AppBuilder::new().executor(Arc::new(Noop)).build();
        assert!(matches!(app, Err(BuildError::MissingStore)));
    }

    #[test]
    fn build_requires_an_executor() {
        let app = AppBuilder::new().store(store()).build();
        assert!(matches!(app, Err(BuildError::MissingExecutor)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = QueueConfig {
            batch_size: 0,
            ..QueueConfig::default()
        };
        let app = AppBuilder::new()
            .store(store())
            .executor(Arc::new(Noop))
            .config(config)
            .build();
        assert!(matches!(app, Err(BuildError::InvalidConfig(QueueError::Config(_)))));
    }

    #[test]
    fn build_applies_config_policies() {
        let config = QueueConfig {
            lease_secs: 42,
            max_retry: 2,
            ..QueueConfig::default()
        };
        let app = AppBuilder::new()
            .store(store())
            .executor(Arc::new(Noop))
            .config(config)
            .build()
            .unwrap();
        assert_eq!(app.queue().lease().duration.as_secs(), 42);
        assert_eq!(app.queue().retry().max_retry, 2);
    }

    #[tokio::test]
    async fn spawned_app_shuts_down_cleanly() {
        let app = AppBuilder::new()
            .store(store())
            .executor(Arc::new(Noop))
            .config(QueueConfig {
                workers: 3,
                ..QueueConfig::default()
            })
            .build()
            .unwrap();

        let handle = app.spawn();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle.shutdown_and_join())
            .await
            .unwrap();
    }
}
