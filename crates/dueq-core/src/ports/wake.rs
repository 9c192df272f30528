//! WakeSignal port - "work may be available" 通知
//!
//! best-effort の fire-and-forget broadcast です。配送保証も順序保証もなく、
//! worker は常にポーリングで正しさを保ちます。通知は待ち時間を短くするだけ。

use async_trait::async_trait;

use crate::domain::QueueError;

#[async_trait]
pub trait WakeSignal: Send + Sync {
    /// Broadcast a wake event. Failures are swallowed (and logged) by the
    /// implementation; callers never depend on delivery.
    async fn notify(&self);

    /// Open a subscription. Each idle worker holds its own listener.
    async fn listen(&self) -> Result<Box<dyn WakeListener>, QueueError>;
}

#[async_trait]
pub trait WakeListener: Send {
    /// Resolves on the next wake event. May also resolve spuriously.
    async fn wait(&mut self);
}
