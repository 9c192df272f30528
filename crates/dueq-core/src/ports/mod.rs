//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（PostgreSQL, LISTEN/NOTIFY, 通知先 API など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! - PostgreSQL（または InMemory）が source of truth（正本）
//! - wake 通知は遅延を減らすだけの最適化（正しさには不要）

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod wake;
pub mod work_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::executor::{ExecutionError, SideEffect};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::wake::{WakeListener, WakeSignal};
pub use self::work_store::{ClaimedItem, Receipt, WorkStore};
