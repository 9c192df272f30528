//! Implementations - ports の具象実装
//!
//! - `inmem_store`: InMemoryWorkStore（テスト・開発用）
//! - `pg_store`: PostgresWorkStore（本番用）
//! - `wake`: BroadcastWake / PgNotifyWake

pub mod inmem_store;
pub mod pg_store;
pub mod wake;

pub use self::inmem_store::InMemoryWorkStore;
pub use self::pg_store::{PostgresWorkStore, connect_pool};
pub use self::wake::{BroadcastWake, PgNotifyWake};
