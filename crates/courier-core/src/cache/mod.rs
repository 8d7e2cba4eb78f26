//! KeyedCache - TTL 付きキャッシュ + キー単位のベストエフォート mutex
//!
//! # 二つの使い方
//! - **cache-aside**: `get` は hit ならそのまま返し、miss なら compute して保存
//! - **keyed lock**: `perform_action_with_lock` はキーが空いているときだけ
//!   lock token を置いて action を実行し、終わったら必ず token を外す
//!
//! 値と lock token は同じ namespace に入ります。キーに生きている entry が
//! （値でも lock でも）ある限り、lock は取れません。
//!
//! # 並行性
//! - KeySetIndex の更新と store の更新は index の Mutex の中で一緒に行う
//! - Mutex は compute / action の実行中には保持しない
//! - `get` の miss は直列化しない。同じキーで競合すると compute が複数回走りうる
//!   （at-most-once が必要なら lock の方を使う）

mod entry;

pub use self::entry::{CacheEntry, LockToken, Slot};

use std::collections::HashSet;
use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::entry::{expiry_after, is_live};
use crate::classify::{ErrorClassifier, ErrorContext};
use crate::config::CacheConfig;
use crate::domain::{CorrelationId, LockOwnerId};
use crate::error::CourierError;
use crate::impls::InMemoryStore;
use crate::ports::{Clock, CorrelationIdGenerator, SystemClock, UlidGenerator, UnderlyingStore};

pub struct KeyedCache<V, S = InMemoryStore<CacheEntry<V>>> {
    store: S,
    /// KeySetIndex: keys inserted through this cache that are still in the store.
    index: Mutex<HashSet<String>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn CorrelationIdGenerator>,
    classifier: Arc<ErrorClassifier>,
    shutdown: CancellationToken,
    _value: PhantomData<fn() -> V>,
}

impl<V> KeyedCache<V, InMemoryStore<CacheEntry<V>>>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(InMemoryStore::new(), config)
    }
}

impl<V, S> KeyedCache<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: UnderlyingStore<CacheEntry<V>>,
{
    pub fn new(store: S, config: CacheConfig) -> Self {
        Self {
            store,
            index: Mutex::new(HashSet::new()),
            config,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            classifier: Arc::new(ErrorClassifier::default()),
            shutdown: CancellationToken::new(),
            _value: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn CorrelationIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert or overwrite `key`, expiring `ttl` from now.
    pub fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), CourierError> {
        validate_key(key)?;
        let now = self.clock.now();
        self.insert(key, CacheEntry::value(value, now), expiry_after(now, ttl));
        Ok(())
    }

    /// `set` with `CacheConfig::default_ttl`.
    pub fn set_default(&self, key: &str, value: V) -> Result<(), CourierError> {
        self.set(key, value, self.config.default_ttl())
    }

    /// Insert without expiry. Only `remove` / `clear` drop it.
    pub fn set_persistent(&self, key: &str, value: V) -> Result<(), CourierError> {
        validate_key(key)?;
        let now = self.clock.now();
        self.insert(key, CacheEntry::value(value, now), None);
        Ok(())
    }

    /// Cache-aside read. A live value is returned without calling `compute`;
    /// otherwise `compute` runs and its value is stored for `ttl`.
    ///
    /// A key currently held by a lock token counts as a miss, and the computed
    /// value is returned without replacing the token.
    pub fn get<E, F>(&self, key: &str, compute: F, ttl: Duration) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: From<CourierError> + StdError + 'static,
    {
        self.get_traced(key, compute, ttl, None)
    }

    /// [`Self::get`] whose failure report carries the caller's correlation id.
    pub fn get_with_correlation<E, F>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        correlation_id: CorrelationId,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: From<CourierError> + StdError + 'static,
    {
        self.get_traced(key, compute, ttl, Some(correlation_id))
    }

    fn get_traced<E, F>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        correlation_id: Option<CorrelationId>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: From<CourierError> + StdError + 'static,
    {
        validate_key(key)?;
        if let Some(value) = self.cached_value(key) {
            debug!(key, "cache hit");
            return Ok(value);
        }
        debug!(key, "cache miss");

        let value =
            compute().map_err(|e| self.report_failure("cache.get", key, correlation_id, e))?;
        self.populate(key, value.clone(), ttl);
        Ok(value)
    }

    /// Async flavour of [`Self::get`]. No lock is held while `compute` runs.
    pub async fn get_async<E, F, Fut>(&self, key: &str, compute: F, ttl: Duration) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: From<CourierError> + StdError + 'static,
    {
        self.get_async_traced(key, compute, ttl, None).await
    }

    pub async fn get_async_with_correlation<E, F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        correlation_id: CorrelationId,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: From<CourierError> + StdError + 'static,
    {
        self.get_async_traced(key, compute, ttl, Some(correlation_id))
            .await
    }

    async fn get_async_traced<E, F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        correlation_id: Option<CorrelationId>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: From<CourierError> + StdError + 'static,
    {
        validate_key(key)?;
        if let Some(value) = self.cached_value(key) {
            debug!(key, "cache hit");
            return Ok(value);
        }
        debug!(key, "cache miss");

        let value = compute()
            .await
            .map_err(|e| self.report_failure("cache.get", key, correlation_id, e))?;
        self.populate(key, value.clone(), ttl);
        Ok(value)
    }

    /// No-op if absent.
    pub fn remove(&self, key: &str) -> Result<(), CourierError> {
        validate_key(key)?;
        let mut index = self.index();
        self.store.remove(key);
        index.remove(key);
        Ok(())
    }

    /// Drop every entry inserted through this cache. Entries other
    /// components put into a shared store are left alone.
    pub fn clear(&self) {
        let mut index = self.index();
        for key in index.drain() {
            self.store.remove(&key);
        }
    }

    /// True iff a live entry (value or lock) exists for `key`.
    pub fn is_set(&self, key: &str) -> Result<bool, CourierError> {
        validate_key(key)?;
        Ok(self.live_entry(key).is_some())
    }

    /// Snapshot of the tracked keys. May be stale as soon as it returns, and
    /// may still name entries that expired but were not evicted yet.
    pub fn get_keys(&self) -> HashSet<String> {
        self.index().clone()
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `action` while holding the keyed lock.
    ///
    /// `timeout` bounds how long the token survives if it is never released;
    /// zero is rejected with `CourierError::InvalidArgument`.
    ///
    /// Returns `Ok(false)` without running `action` if any live entry occupies
    /// `key`. Otherwise runs it and returns `Ok(true)`. The lock token is
    /// removed on every exit path (error, panic) before the result is handed
    /// back; an `action` error is returned unchanged.
    pub fn perform_action_with_lock<E, F>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
    ) -> Result<bool, E>
    where
        F: FnOnce() -> Result<(), E>,
        E: From<CourierError> + StdError + 'static,
    {
        self.with_lock(key, timeout, action).map(|ran| ran.is_some())
    }

    /// Like [`Self::perform_action_with_lock`] but hands back the action's
    /// value; `None` means the key was occupied.
    pub fn with_lock<R, E, F>(&self, key: &str, timeout: Duration, action: F) -> Result<Option<R>, E>
    where
        F: FnOnce() -> Result<R, E>,
        E: From<CourierError> + StdError + 'static,
    {
        self.with_lock_traced(key, timeout, action, None)
    }

    /// [`Self::with_lock`] whose failure report carries the caller's
    /// correlation id.
    pub fn with_lock_with_correlation<R, E, F>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
        correlation_id: CorrelationId,
    ) -> Result<Option<R>, E>
    where
        F: FnOnce() -> Result<R, E>,
        E: From<CourierError> + StdError + 'static,
    {
        self.with_lock_traced(key, timeout, action, Some(correlation_id))
    }

    fn with_lock_traced<R, E, F>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Option<R>, E>
    where
        F: FnOnce() -> Result<R, E>,
        E: From<CourierError> + StdError + 'static,
    {
        validate_key(key)?;
        validate_timeout(timeout)?;
        let Some(guard) = self.acquire(key, timeout) else {
            debug!(key, "lock busy");
            return Ok(None);
        };

        let result = action();
        drop(guard);

        result
            .map(Some)
            .map_err(|e| self.report_failure("cache.lock", key, correlation_id, e))
    }

    pub async fn perform_action_with_lock_async<E, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
    ) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<CourierError> + StdError + 'static,
    {
        self.with_lock_async(key, timeout, action)
            .await
            .map(|ran| ran.is_some())
    }

    /// Async flavour of [`Self::with_lock`]. The token is also released when
    /// the returned future is dropped mid-action.
    pub async fn with_lock_async<R, E, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
    ) -> Result<Option<R>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CourierError> + StdError + 'static,
    {
        self.with_lock_async_traced(key, timeout, action, None).await
    }

    pub async fn with_lock_async_with_correlation<R, E, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
        correlation_id: CorrelationId,
    ) -> Result<Option<R>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CourierError> + StdError + 'static,
    {
        self.with_lock_async_traced(key, timeout, action, Some(correlation_id))
            .await
    }

    async fn with_lock_async_traced<R, E, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        action: F,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Option<R>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CourierError> + StdError + 'static,
    {
        validate_key(key)?;
        validate_timeout(timeout)?;
        let Some(guard) = self.acquire(key, timeout) else {
            debug!(key, "lock busy");
            return Ok(None);
        };

        let result = action().await;
        drop(guard);

        result
            .map(Some)
            .map_err(|e| self.report_failure("cache.lock", key, correlation_id, e))
    }

    /// Evict every tracked entry whose expiry has passed. Returns how many
    /// keys left the index.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut index = self.index();
        let before = index.len();
        index.retain(|key| match self.store.get(key) {
            Some((_, expires_at)) if is_live(expires_at, now) => true,
            Some(_) => {
                self.store.remove(key);
                false
            }
            None => false,
        });
        before - index.len()
    }

    /// Stop the background eviction task. Idempotent; the cache stays usable
    /// with lazy expiry only.
    pub fn dispose(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            debug!("cache disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn index(&self) -> MutexGuard<'_, HashSet<String>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, key: &str, entry: CacheEntry<V>, expires_at: Option<chrono::DateTime<chrono::Utc>>) {
        let mut index = self.index();
        self.store.set(key, entry, expires_at);
        index.insert(key.to_string());
    }

    /// Live entry for `key`. An expired entry is evicted on the way.
    fn live_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        let mut index = self.index();
        match self.store.get(key) {
            Some((entry, expires_at)) if is_live(expires_at, now) => Some(entry),
            Some(_) => {
                self.store.remove(key);
                index.remove(key);
                None
            }
            None => {
                index.remove(key);
                None
            }
        }
    }

    fn cached_value(&self, key: &str) -> Option<V> {
        match self.live_entry(key)?.slot {
            Slot::Value(value) => Some(value),
            Slot::Lock(_) => None,
        }
    }

    /// Store a computed value unless a live lock token holds the key.
    fn populate(&self, key: &str, value: V, ttl: Duration) {
        let now = self.clock.now();
        let mut index = self.index();
        if let Some((entry, expires_at)) = self.store.get(key)
            && matches!(entry.slot, Slot::Lock(_))
            && is_live(expires_at, now)
        {
            debug!(key, "key is locked, computed value not cached");
            return;
        }
        self.store
            .set(key, CacheEntry::value(value, now), expiry_after(now, ttl));
        index.insert(key.to_string());
    }

    /// Atomic absent -> locked transition.
    fn acquire(&self, key: &str, timeout: Duration) -> Option<LockGuard<'_, V, S>> {
        let owner = self.ids.generate_lock_owner_id();
        let now = self.clock.now();
        {
            let mut index = self.index();
            if let Some((_, expires_at)) = self.store.get(key)
                && is_live(expires_at, now)
            {
                return None;
            }
            self.store
                .set(key, CacheEntry::lock(owner, now), expiry_after(now, timeout));
            index.insert(key.to_string());
        }
        debug!(key, %owner, "lock acquired");
        Some(LockGuard {
            cache: self,
            key: key.to_string(),
            owner,
        })
    }

    /// Remove the token if it is still ours. A token that expired and was
    /// taken over, or overwritten by `set`, is left alone.
    fn release(&self, key: &str, owner: LockOwnerId) {
        let mut index = self.index();
        match self.store.get(key) {
            Some((entry, _)) if entry.is_lock_of(owner) => {
                self.store.remove(key);
                index.remove(key);
                debug!(key, %owner, "lock released");
            }
            _ => debug!(key, %owner, "lock token already gone"),
        }
    }

    /// Classify and log `failure`, then hand it back untouched. A fresh
    /// correlation id is generated only when the caller supplied none.
    fn report_failure<E>(
        &self,
        operation: &str,
        key: &str,
        correlation_id: Option<CorrelationId>,
        failure: E,
    ) -> E
    where
        E: StdError + 'static,
    {
        let correlation_id =
            correlation_id.unwrap_or_else(|| self.ids.generate_correlation_id());
        let mut context = ErrorContext::new();
        context.insert("key".to_string(), key.to_string());
        let record = self
            .classifier
            .classify(&failure, operation, correlation_id, context);
        self.classifier.report(&record);
        failure
    }
}

impl<V, S> KeyedCache<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: UnderlyingStore<CacheEntry<V>> + 'static,
{
    /// Periodically purge expired entries until `dispose` is called or the
    /// cache is dropped.
    pub fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.eviction_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "evicted expired cache entries");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("cache eviction task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl<V, S> Drop for KeyedCache<V, S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct LockGuard<'a, V, S>
where
    V: Clone + Send + Sync + 'static,
    S: UnderlyingStore<CacheEntry<V>>,
{
    cache: &'a KeyedCache<V, S>,
    key: String,
    owner: LockOwnerId,
}

impl<V, S> Drop for LockGuard<'_, V, S>
where
    V: Clone + Send + Sync + 'static,
    S: UnderlyingStore<CacheEntry<V>>,
{
    fn drop(&mut self) {
        self.cache.release(&self.key, self.owner);
    }
}

/// A zero timeout would write a token that is already expired, so the key
/// could be taken again during the critical section.
fn validate_timeout(timeout: Duration) -> Result<(), CourierError> {
    if timeout.is_zero() {
        return Err(CourierError::InvalidArgument(
            "lock timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), CourierError> {
    if key.trim().is_empty() {
        return Err(CourierError::InvalidKey(format!("{key:?} is empty")));
    }
    Ok(())
}
