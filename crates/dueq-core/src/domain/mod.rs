//! Domain model (ids, work item FSM, policies, errors).
//!
//! ここには I/O を含めません。時刻は引数で受け取り、状態遷移は純粋関数として
//! 実装します。ストア実装（impls）はこのモジュールの遷移をそのまま適用します。

pub mod archive;
pub mod errors;
pub mod ids;
pub mod item;
pub mod policy;
pub mod settlement;

pub use archive::ArchiveRecord;
pub use errors::{ErrorKind, QueueError};
pub use ids::{LeaseToken, WorkItemId};
pub use item::{ItemStatus, NewWorkItem, PayloadRef, WorkItem};
pub use policy::{LeasePolicy, RetryPolicy};
pub use settlement::{Settlement, SettlementKind};
