//! InMemoryStore - プロセス内の UnderlyingStore 実装
//!
//! # 実装詳細
//! - HashMap<String, StoredValue<V>> を std Mutex で保護
//! - ロックは各操作の間だけ保持（await を跨がない）
//! - 期限切れの判定はしない（KeyedCache が Clock で判定する）

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::ports::UnderlyingStore;

#[derive(Debug, Clone)]
struct StoredValue<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct InMemoryStore<V> {
    entries: Mutex<HashMap<String, StoredValue<V>>>,
}

impl<V> InMemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for InMemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> UnderlyingStore<V> for InMemoryStore<V> {
    fn set(&self, key: &str, value: V, expires_at: Option<DateTime<Utc>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), StoredValue { value, expires_at });
    }

    fn get(&self, key: &str) -> Option<(V, Option<DateTime<Utc>>)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|stored| (stored.value.clone(), stored.expires_at))
    }

    fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }

    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
