//! dueq-core
//!
//! Durable at-least-once work queue on a single shared table.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, WorkItem FSM, policy, settlement, errors）
//! - **ports**: 抽象化レイヤー（WorkStore, WakeSignal, SideEffect, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryWorkStore, PostgresWorkStore, BroadcastWake, PgNotifyWake）
//! - **app**: アプリケーションロジック（Queue, worker / reaper / cleanup ループ, builder）
//! - **config**: 環境変数からの設定
//! - **observability**: tracing の初期化
//!
//! # 不変条件
//! - 二つの claim が同じ item を返すことはない
//! - ack / nack は冪等（retry_count を二重に増やさない）
//! - `retry_count >= max_retry` の item は claim されない
//! - archive は冪等で、クラッシュ後の再実行が安全

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{App, AppBuilder, AppHandle, Queue};
pub use config::QueueConfig;
pub use domain::{
    ItemStatus, LeasePolicy, NewWorkItem, PayloadRef, QueueError, RetryPolicy, Settlement,
    WorkItem, WorkItemId,
};
