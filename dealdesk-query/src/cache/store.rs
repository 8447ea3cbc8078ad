//! The query cache.
//!
//! One map behind one `std::sync::Mutex`. The lock is never held across an
//! await: fetches read what they need, release the lock, run the fetcher, and
//! re-acquire to store the result. Every write bumps the entry's fetch
//! generation, and a fetch result is stored only if the generation it started
//! with is still current, so a late fetch can never clobber a newer write.

use dealdesk_core::{CacheError, DealDeskError, DealDeskResult};
use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, EntryState, QueryOptions, QueryRead};
use super::key::{KeyFilter, QueryKey};
use super::traits::{CacheStats, QueryFetcher};
use crate::events::{CacheEvent, EventBus, UpdateSource};
use crate::retry::{retry_read, RetryPolicy};

/// Options for [`QueryCache::invalidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateOptions {
    /// Refetch entries that currently have observers.
    pub refetch_active: bool,
}

impl InvalidateOptions {
    pub fn mark_only() -> Self {
        Self {
            refetch_active: false,
        }
    }
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            refetch_active: true,
        }
    }
}

/// Outcome of an invalidation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    /// Keys marked stale, in key order.
    pub invalidated: Vec<QueryKey>,
    /// Observed keys whose refetch stored a new value.
    pub refetched: Vec<QueryKey>,
    /// Refetches superseded by a newer write or fetch.
    pub superseded: Vec<QueryKey>,
    /// Refetches that failed.
    pub failed: Vec<(QueryKey, DealDeskError)>,
}

impl InvalidationReport {
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty()
    }
}

/// One key changed by an optimistic patch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PatchedKey {
    pub key: QueryKey,
    pub previous: Value,
    pub optimistic: Value,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
    cancelled_fetches: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<QueryKey, CacheEntry>,
    counters: Counters,
}

struct Inner {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    defaults: QueryOptions,
}

/// Shared query cache. Cloning is cheap and shares the same map.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    /// Create a cache on the system clock with its own event bus.
    pub fn new(defaults: QueryOptions) -> Self {
        Self::with_parts(defaults, Arc::new(SystemClock), EventBus::default())
    }

    pub fn with_parts(defaults: QueryOptions, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                clock,
                events,
                defaults,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn defaults(&self) -> &QueryOptions {
        &self.inner.defaults
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: CacheEvent) {
        self.inner.events.publish(event);
    }

    fn new_entry(&self) -> CacheEntry {
        CacheEntry::new(self.inner.clock.now(), self.inner.defaults.clone())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Current value for `key`. `None` means unknown, never empty.
    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        let now = self.inner.clock.now();
        let mut state = self.lock();
        let expired = state.entries.get(key)?.is_expired(now);
        if expired {
            state.entries.remove(key);
            state.counters.evictions += 1;
            drop(state);
            debug!(key = %key, "Evicted expired entry on read");
            self.publish(CacheEvent::EntryEvicted { key: key.clone() });
            return None;
        }
        state.entries.get(key).and_then(|entry| entry.value.clone())
    }

    /// Typed view of [`get`](Self::get).
    pub fn get_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, CacheError> {
        self.get(key)
            .map(|value| decode(key, value))
            .transpose()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.get(key).is_some()
    }

    /// Cached keys matching `filter`, in key order.
    pub fn keys(&self, filter: &KeyFilter) -> Vec<QueryKey> {
        let state = self.lock();
        let keys: BTreeSet<&QueryKey> = state.entries.keys().filter(|k| filter.matches(k)).collect();
        keys.into_iter().cloned().collect()
    }

    pub fn entry_state(&self, key: &QueryKey) -> Option<EntryState> {
        self.lock().entries.get(key).map(CacheEntry::state)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.counters.hits,
            misses: state.counters.misses,
            entries: state.entries.len() as u64,
            evictions: state.counters.evictions,
            invalidations: state.counters.invalidations,
            cancelled_fetches: state.counters.cancelled_fetches,
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Replace the value for `key`, creating the entry if needed.
    pub fn set(&self, key: &QueryKey, value: Value) {
        self.write_with_source(key, value, UpdateSource::Set);
    }

    pub fn set_data<T: Serialize>(&self, key: &QueryKey, value: &T) -> Result<(), CacheError> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Atomically replace the current value with `f(current)`.
    ///
    /// Absent values are left absent and `f` is not called. Returns the new
    /// value when one was written.
    pub fn update<F>(&self, key: &QueryKey, f: F) -> Option<Value>
    where
        F: FnOnce(&Value) -> Value,
    {
        let now = self.inner.clock.now();
        let written = {
            let mut state = self.lock();
            let entry = state.entries.get_mut(key)?;
            let next = f(entry.value.as_ref()?);
            entry.write(next.clone(), now);
            next
        };
        self.publish(CacheEvent::EntryUpdated {
            key: key.clone(),
            source: UpdateSource::Set,
        });
        Some(written)
    }

    /// Typed view of [`update`](Self::update).
    ///
    /// A value that does not deserialize into `T` is left untouched and the
    /// error returned.
    pub fn update_data<T, F>(&self, key: &QueryKey, f: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T) -> T,
    {
        let now = self.inner.clock.now();
        let written = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return Ok(None);
            };
            let Some(current) = entry.value.as_ref() else {
                return Ok(None);
            };
            let current: T = decode(key, current.clone())?;
            let next = f(&current);
            entry.write(serde_json::to_value(&next)?, now);
            next
        };
        self.publish(CacheEvent::EntryUpdated {
            key: key.clone(),
            source: UpdateSource::Set,
        });
        Ok(Some(written))
    }

    pub(crate) fn write_with_source(&self, key: &QueryKey, value: Value, source: UpdateSource) {
        let now = self.inner.clock.now();
        {
            let mut state = self.lock();
            if !state.entries.contains_key(key) {
                let entry = self.new_entry();
                state.entries.insert(key.clone(), entry);
            }
            if let Some(entry) = state.entries.get_mut(key) {
                entry.write(value, now);
            }
        }
        debug!(key = %key, source = ?source, "Cache write");
        self.publish(CacheEvent::EntryUpdated {
            key: key.clone(),
            source,
        });
    }

    /// Run `patch` over every entry holding a value, under one lock.
    ///
    /// `patch` returns `None` to leave an entry alone. Returns the changed
    /// keys with their previous and new values, in key order.
    pub(crate) fn patch_all<F>(&self, mut patch: F) -> Vec<PatchedKey>
    where
        F: FnMut(&QueryKey, &Value) -> Option<Value>,
    {
        let now = self.inner.clock.now();
        let patched = {
            let mut state = self.lock();
            let keys: BTreeSet<QueryKey> = state.entries.keys().cloned().collect();
            let mut patched = Vec::new();
            for key in keys {
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                let Some(previous) = entry.value.clone() else {
                    continue;
                };
                let Some(optimistic) = patch(&key, &previous) else {
                    continue;
                };
                entry.write(optimistic.clone(), now);
                patched.push(PatchedKey {
                    key,
                    previous,
                    optimistic,
                });
            }
            patched
        };
        for item in &patched {
            self.publish(CacheEvent::EntryUpdated {
                key: item.key.clone(),
                source: UpdateSource::Optimistic,
            });
        }
        patched
    }

    /// Put `previous` back if the entry still holds `expected`.
    pub(crate) fn restore_if(&self, key: &QueryKey, expected: &Value, previous: Value) -> bool {
        let now = self.inner.clock.now();
        let restored = {
            let mut state = self.lock();
            match state.entries.get_mut(key) {
                Some(entry) if entry.value.as_ref() == Some(expected) => {
                    entry.write(previous, now);
                    true
                }
                _ => false,
            }
        };
        if restored {
            self.publish(CacheEvent::EntryUpdated {
                key: key.clone(),
                source: UpdateSource::Rollback,
            });
        }
        restored
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    // ========================================================================
    // FETCHING
    // ========================================================================

    /// Return the cached value if fresh, otherwise fetch it.
    ///
    /// The fetcher is remembered on the entry for later refetches. A result
    /// superseded by a newer write or fetch is discarded and reported as
    /// [`CacheError::Cancelled`].
    pub async fn fetch(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
        options: &QueryOptions,
    ) -> DealDeskResult<QueryRead<Value>> {
        let now = self.inner.clock.now();
        let generation = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.entries.get(key).is_some_and(|e| e.is_expired(now)) {
                state.entries.remove(key);
                state.counters.evictions += 1;
            }
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(now, options.clone()));
            entry.options = options.clone();
            entry.fetcher = Some(Arc::clone(&fetcher));
            if entry.is_fresh(now) {
                if let Some(value) = entry.value.clone() {
                    let updated_at = entry.updated_at;
                    state.counters.hits += 1;
                    debug!(key = %key, "Cache hit");
                    return Ok(QueryRead::from_cache(value, updated_at));
                }
            }
            let generation = entry.begin_fetch();
            state.counters.misses += 1;
            generation
        };
        debug!(key = %key, generation = generation, "Cache miss, fetching");
        self.run_fetch(key, fetcher, options.retry.clone(), generation)
            .await
    }

    /// Typed view of [`fetch`](Self::fetch).
    pub async fn fetch_data<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
        options: &QueryOptions,
    ) -> DealDeskResult<QueryRead<T>> {
        let read = self.fetch(key, fetcher, options).await?;
        Ok(read.try_map(|value| decode(key, value))?)
    }

    /// Fetch again with the entry's remembered fetcher, ignoring freshness.
    pub async fn refetch(&self, key: &QueryKey) -> DealDeskResult<QueryRead<Value>> {
        let (fetcher, retry, generation) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state
                .entries
                .get_mut(key)
                .ok_or_else(|| missing_fetcher(key))?;
            let fetcher = entry.fetcher.clone().ok_or_else(|| missing_fetcher(key))?;
            let retry = entry.options.retry.clone();
            let generation = entry.begin_fetch();
            state.counters.misses += 1;
            (fetcher, retry, generation)
        };
        self.run_fetch(key, fetcher, retry, generation).await
    }

    async fn run_fetch(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
        retry: RetryPolicy,
        generation: u64,
    ) -> DealDeskResult<QueryRead<Value>> {
        let label = key.to_string();
        let mut pending = PendingFetch {
            cache: self,
            key,
            generation,
            settled: false,
        };
        let result = retry_read(&retry, &label, || fetcher.fetch(key)).await;
        pending.settled = true;
        let now = self.inner.clock.now();

        let outcome = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let current = state
                .entries
                .get_mut(key)
                .filter(|entry| entry.generation == generation);
            match (current, result) {
                (None, _) => {
                    state.counters.cancelled_fetches += 1;
                    None
                }
                (Some(entry), Ok(value)) => {
                    entry.complete_fetch(value.clone(), now);
                    Some(Ok(QueryRead::from_fetch(value, now)))
                }
                (Some(entry), Err(err)) => {
                    entry.fail_fetch(err.clone(), now);
                    Some(Err(err))
                }
            }
        };

        match outcome {
            None => {
                debug!(key = %key, generation = generation, "Discarded superseded fetch");
                self.publish(CacheEvent::FetchCancelled { key: key.clone() });
                Err(CacheError::Cancelled { key: label }.into())
            }
            Some(Ok(read)) => {
                self.publish(CacheEvent::EntryUpdated {
                    key: key.clone(),
                    source: UpdateSource::Fetch,
                });
                Ok(read)
            }
            Some(Err(err)) => {
                warn!(key = %key, error = %err, "Fetch failed");
                Err(err)
            }
        }
    }

    /// Supersede the in-flight fetch for `key`, if any.
    pub fn cancel_inflight(&self, key: &QueryKey) -> bool {
        let cancelled = self
            .lock()
            .entries
            .get_mut(key)
            .is_some_and(CacheEntry::cancel_fetch);
        if cancelled {
            debug!(key = %key, "Cancelled in-flight fetch");
        }
        cancelled
    }

    /// Supersede in-flight fetches for every key matching `filter`.
    pub fn cancel_matching(&self, filter: &KeyFilter) -> Vec<QueryKey> {
        let mut state = self.lock();
        let mut cancelled: Vec<QueryKey> = state
            .entries
            .iter_mut()
            .filter(|(key, _)| filter.matches(key))
            .filter_map(|(key, entry)| entry.cancel_fetch().then(|| key.clone()))
            .collect();
        cancelled.sort();
        cancelled
    }

    // ========================================================================
    // OBSERVERS AND GARBAGE COLLECTION
    // ========================================================================

    /// Register interest in `key`. The entry is never collected while any
    /// observer is alive, and active entries are refetched on invalidation.
    pub fn observe(&self, key: &QueryKey) -> QueryObserver {
        {
            let mut state = self.lock();
            if !state.entries.contains_key(key) {
                let entry = self.new_entry();
                state.entries.insert(key.clone(), entry);
            }
            if let Some(entry) = state.entries.get_mut(key) {
                entry.add_observer();
            }
        }
        QueryObserver {
            cache: self.clone(),
            key: key.clone(),
        }
    }

    fn release_observer(&self, key: &QueryKey) {
        let now = self.inner.clock.now();
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.remove_observer(now);
        }
    }

    /// Remove unobserved entries whose GC time has elapsed.
    pub fn collect_garbage(&self) -> usize {
        let now = self.inner.clock.now();
        let evicted: Vec<QueryKey> = {
            let mut state = self.lock();
            let expired: Vec<QueryKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.entries.remove(key);
            }
            state.counters.evictions += expired.len() as u64;
            expired
        };
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Collected expired cache entries");
        }
        let count = evicted.len();
        for key in evicted {
            self.publish(CacheEvent::EntryEvicted { key });
        }
        count
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `interval` until
    /// the last cache handle is dropped.
    pub fn spawn_gc(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                QueryCache { inner }.collect_garbage();
            }
        })
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Mark every entry matching `filter` stale and refetch observed ones.
    pub async fn invalidate(
        &self,
        filter: &KeyFilter,
        options: InvalidateOptions,
    ) -> InvalidationReport {
        self.invalidate_many(std::slice::from_ref(filter), options)
            .await
    }

    /// Invalidate the union of `filters`; each matching key is handled once.
    pub async fn invalidate_many(
        &self,
        filters: &[KeyFilter],
        options: InvalidateOptions,
    ) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let targets = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let matched: BTreeSet<QueryKey> = state
                .entries
                .keys()
                .filter(|key| filters.iter().any(|f| f.matches(key)))
                .cloned()
                .collect();
            state.counters.invalidations += matched.len() as u64;

            let mut targets = Vec::new();
            for key in &matched {
                let Some(entry) = state.entries.get_mut(key) else {
                    continue;
                };
                entry.mark_stale();
                if options.refetch_active && entry.observers > 0 {
                    if let Some(fetcher) = entry.fetcher.clone() {
                        let retry = entry.options.retry.clone();
                        let generation = entry.begin_fetch();
                        targets.push((key.clone(), fetcher, retry, generation));
                    }
                }
            }
            report.invalidated = matched.into_iter().collect();
            targets
        };

        for key in &report.invalidated {
            self.publish(CacheEvent::EntryInvalidated { key: key.clone() });
        }
        debug!(
            invalidated = report.invalidated.len(),
            refetching = targets.len(),
            "Invalidated cache entries"
        );

        let refetches = targets.iter().map(|(key, fetcher, retry, generation)| async move {
            let result = self
                .run_fetch(key, Arc::clone(fetcher), retry.clone(), *generation)
                .await;
            (key.clone(), result)
        });
        for (key, result) in join_all(refetches).await {
            match result {
                Ok(_) => report.refetched.push(key),
                Err(DealDeskError::Cache(CacheError::Cancelled { .. })) => {
                    report.superseded.push(key)
                }
                Err(err) => report.failed.push((key, err)),
            }
        }
        report
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.lock().entries.len();
        f.debug_struct("QueryCache")
            .field("entries", &entries)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QueryOptions::default())
    }
}

/// RAII registration of interest in one key.
#[derive(Debug)]
pub struct QueryObserver {
    cache: QueryCache,
    key: QueryKey,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current value of the observed key.
    pub fn value(&self) -> Option<Value> {
        self.cache.get(&self.key)
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release_observer(&self.key);
    }
}

/// Marks the entry stale if a fetch future is dropped before it settles,
/// so the entry leaves `Fetching` and its GC timer runs again.
struct PendingFetch<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
    generation: u64,
    settled: bool,
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let now = self.cache.inner.clock.now();
        let abandoned = self
            .cache
            .lock()
            .entries
            .get_mut(self.key)
            .is_some_and(|entry| entry.abandon_fetch(self.generation, now));
        if abandoned {
            debug!(key = %self.key, generation = self.generation, "Fetch dropped before settling");
        }
    }
}

fn decode<T: DeserializeOwned>(key: &QueryKey, value: Value) -> Result<T, CacheError> {
    serde_json::from_value(value).map_err(|e| CacheError::Deserialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn missing_fetcher(key: &QueryKey) -> DealDeskError {
    CacheError::MissingFetcher {
        key: key.to_string(),
    }
    .into()
}
