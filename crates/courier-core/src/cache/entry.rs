//! Cache entries: ordinary values and lock tokens share one namespace.

use chrono::{DateTime, Utc};

use crate::domain::LockOwnerId;

/// Presence of this token under a key means "critical section in progress".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    pub owner: LockOwnerId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot<V> {
    Value(V),
    Lock(LockToken),
}

/// What the cache hands to the underlying store. Expiry is passed to the
/// store next to the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub slot: Slot<V>,
    pub created_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn value(value: V, created_at: DateTime<Utc>) -> Self {
        Self {
            slot: Slot::Value(value),
            created_at,
        }
    }

    pub fn lock(owner: LockOwnerId, created_at: DateTime<Utc>) -> Self {
        Self {
            slot: Slot::Lock(LockToken { owner }),
            created_at,
        }
    }

    pub fn is_lock_of(&self, owner: LockOwnerId) -> bool {
        matches!(self.slot, Slot::Lock(token) if token.owner == owner)
    }
}

/// Live means "no expiry, or expiry strictly in the future".
pub(crate) fn is_live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_none_or(|at| now < at)
}

/// `now + ttl`; a ttl too large to represent never expires.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}
