//! UnderlyingStore port - キャッシュの実体となる key-value store
//!
//! 列挙（keys の一覧）は要求しません。列挙は KeyedCache 側の index が担います。
//! 有効期限の判定も KeyedCache 側が Clock で行うので、store は期限を保存するだけで構いません。

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// UnderlyingStore は有効期限付きの key-value store
///
/// # 設計原則
/// - 同期 API（KeyedCache の bookkeeping は suspend しない）
/// - `Send + Sync`（複数タスクから共有される）
pub trait UnderlyingStore<V>: Send + Sync {
    /// Insert or overwrite.
    fn set(&self, key: &str, value: V, expires_at: Option<DateTime<Utc>>);

    /// Current value and its expiry, regardless of whether it already expired.
    fn get(&self, key: &str) -> Option<(V, Option<DateTime<Utc>>)>;

    /// Returns whether something was removed.
    fn remove(&self, key: &str) -> bool;

    fn clear(&self);
}

/// Lets several caches (or a cache and its owner) share one store.
impl<V, S: UnderlyingStore<V> + ?Sized> UnderlyingStore<V> for Arc<S> {
    fn set(&self, key: &str, value: V, expires_at: Option<DateTime<Utc>>) {
        (**self).set(key, value, expires_at)
    }

    fn get(&self, key: &str) -> Option<(V, Option<DateTime<Utc>>)> {
        (**self).get(key)
    }

    fn remove(&self, key: &str) -> bool {
        (**self).remove(key)
    }

    fn clear(&self) {
        (**self).clear()
    }
}
