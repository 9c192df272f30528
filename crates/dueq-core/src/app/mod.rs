//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Queue**: Enqueue / Claim / Ack / Nack / Sweep / Cleanup の facade
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **WorkerLoop**: claim→execute→ack/nack（adaptive polling + wake）
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **CleanupLoop**: 終端状態の行の archive

pub mod builder;
pub mod cleanup_loop;
pub mod queue;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, AppHandle, BuildError};
pub use self::queue::Queue;
pub use self::status::{CleanupReport, QueueCounts, SweepReport};
pub use self::worker_loop::{PollInterval, WorkerLoop, WorkerSettings};
