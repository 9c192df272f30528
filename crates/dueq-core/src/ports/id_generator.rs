//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{LeaseToken, WorkItemId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数 worker から共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_item_id(&self) -> WorkItemId;

    fn generate_lease_token(&self) -> LeaseToken;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock の時刻を timestamp 部分に使うので、ManualClock を渡すと
/// テスト中の ID 順序も決定的になります（同一ミリ秒内はランダム部で区別）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_item_id(&self) -> WorkItemId {
        WorkItemId::from(self.next_ulid())
    }

    fn generate_lease_token(&self) -> LeaseToken {
        LeaseToken::from(self.next_ulid())
    }
}
