//! WakeSignal 実装
//!
//! - **BroadcastWake**: プロセス内（tokio broadcast）。テスト・InMemory 構成用
//! - **PgNotifyWake**: PostgreSQL `LISTEN/NOTIFY`。複数プロセス構成用。
//!   listener は専用接続一本で、プロセス内へは BroadcastWake で配る
//!
//! どちらも best-effort。取りこぼしても worker の次のポーリングで拾われます。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::{OnceCell, broadcast};
use tokio::task::JoinHandle;

use crate::domain::QueueError;
use crate::impls::pg_store::map_sqlx_error;
use crate::ports::{WakeListener, WakeSignal};

/// In-process wake channel.
///
/// The buffer only has to absorb bursts: a lagged listener just wakes once.
#[derive(Debug, Clone)]
pub struct BroadcastWake {
    tx: broadcast::Sender<()>,
}

impl BroadcastWake {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }
}

impl Default for BroadcastWake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WakeSignal for BroadcastWake {
    async fn notify(&self) {
        // No receivers is the normal "nobody idle" case.
        let _ = self.tx.send(());
    }

    async fn listen(&self) -> Result<Box<dyn WakeListener>, QueueError> {
        Ok(Box::new(BroadcastListener {
            rx: self.tx.subscribe(),
        }))
    }
}

struct BroadcastListener {
    rx: broadcast::Receiver<()>,
}

#[async_trait]
impl WakeListener for BroadcastListener {
    async fn wait(&mut self) {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            // Sender gone: never wake again, polling takes over.
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// `LISTEN/NOTIFY` on a single named channel. No payload.
///
/// # 学習ポイント
/// - `LISTEN` は接続を占有し続けるので、共有 pool からは借りない
/// - プロセスごとに専用接続の listener を一本だけ張り、`BroadcastWake` で
///   各 worker に配る（worker 数と pool サイズが無関係になる）
/// - relay タスクは最初の `listen()` で起動し、最後の clone が drop されると止まる
#[derive(Clone)]
pub struct PgNotifyWake {
    pool: PgPool,
    channel: String,
    relay: Arc<Relay>,
}

struct Relay {
    /// One connection, never shared with store traffic.
    listener_pool: PgPool,
    fanout: BroadcastWake,
    task: OnceCell<RelayTask>,
}

struct RelayTask(JoinHandle<()>);

impl Drop for RelayTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl PgNotifyWake {
    /// Back-off after a listener connection error.
    const RECONNECT_DELAY: Duration = Duration::from_secs(1);

    /// `pool` carries the `NOTIFY`s. The listener opens its own connection
    /// with the same connect options, lazily.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        let options = pool.connect_options();
        let listener_pool = PgPoolOptions::new()
            .max_connections(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connect_lazy_with((*options).clone());
        Self {
            pool,
            channel: channel.into(),
            relay: Arc::new(Relay {
                listener_pool,
                fanout: BroadcastWake::new(),
                task: OnceCell::new(),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn start_relay(&self) -> Result<RelayTask, QueueError> {
        let mut listener = PgListener::connect_with(&self.relay.listener_pool)
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;
        tracing::debug!(channel = %self.channel, "wake relay started");

        let fanout = self.relay.fanout.clone();
        let channel = self.channel.clone();
        Ok(RelayTask(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(_) => fanout.notify().await,
                    Err(e) => {
                        // PgListener re-connects and re-LISTENs on the next recv.
                        tracing::warn!(channel = %channel, error = %e, "wake listener error");
                        tokio::time::sleep(PgNotifyWake::RECONNECT_DELAY).await;
                        // Notifies sent while disconnected are gone; let workers look.
                        fanout.notify().await;
                    }
                }
            }
        })))
    }
}

#[async_trait]
impl WakeSignal for PgNotifyWake {
    async fn notify(&self) {
        let result = sqlx::query("SELECT pg_notify($1, '')")
            .bind(&self.channel)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(channel = %self.channel, error = %e, "wake notify failed");
        }
    }

    async fn listen(&self) -> Result<Box<dyn WakeListener>, QueueError> {
        self.relay
            .task
            .get_or_try_init(|| self.start_relay())
            .await?;
        self.relay.fanout.listen().await
    }
}
