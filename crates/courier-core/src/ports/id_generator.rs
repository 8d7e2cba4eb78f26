//! CorrelationIdGenerator port - correlation id 生成の抽象化
//!
//! correlation id は 1 つの論理操作につき 1 回だけ生成され、
//! ネストした呼び出しやログ行すべてに引き回されます。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{CorrelationId, LockOwnerId};
use crate::ports::Clock;
use ulid::Ulid;

/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait CorrelationIdGenerator: Send + Sync {
    fn generate_correlation_id(&self) -> CorrelationId;

    fn generate_lock_owner_id(&self) -> LockOwnerId;
}

/// UlidGenerator は Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に ManualClock を渡すと timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> CorrelationIdGenerator for UlidGenerator<C> {
    fn generate_correlation_id(&self) -> CorrelationId {
        CorrelationId::from(self.next_ulid())
    }

    fn generate_lock_owner_id(&self) -> LockOwnerId {
        LockOwnerId::from(self.next_ulid())
    }
}
