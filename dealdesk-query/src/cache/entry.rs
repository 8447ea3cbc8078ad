//! Cache entries and read results.

use dealdesk_core::{DealDeskError, QueryConfig, Timestamp};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::clock::add_saturating;
use super::traits::QueryFetcher;
use crate::retry::RetryPolicy;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryStatus {
    /// Holding a value (or nothing yet) with no fetch running.
    #[default]
    Idle,
    /// A fetch is in flight.
    Fetching,
    /// Invalidated; the next read refetches.
    Stale,
    /// The last fetch failed.
    Error,
}

/// Per-query freshness and retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// How long a fetched value counts as fresh.
    pub stale_time: Duration,
    /// How long an unobserved entry survives.
    pub gc_time: Duration,
    pub retry: RetryPolicy,
}

impl QueryOptions {
    pub fn from_config(query: &QueryConfig, retry: RetryPolicy) -> Self {
        Self {
            stale_time: query.stale_time(),
            gc_time: query.gc_time(),
            retry,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default(), RetryPolicy::default())
    }
}

pub(crate) struct CacheEntry {
    pub value: Option<Value>,
    pub status: EntryStatus,
    pub fetched_at: Option<Timestamp>,
    pub updated_at: Timestamp,
    pub stale_at: Option<Timestamp>,
    pub evict_at: Option<Timestamp>,
    pub observers: usize,
    pub generation: u64,
    pub last_error: Option<DealDeskError>,
    pub fetcher: Option<Arc<dyn QueryFetcher>>,
    pub options: QueryOptions,
}

impl CacheEntry {
    pub fn new(now: Timestamp, options: QueryOptions) -> Self {
        let evict_at = Some(add_saturating(now, options.gc_time));
        Self {
            value: None,
            status: EntryStatus::Idle,
            fetched_at: None,
            updated_at: now,
            stale_at: None,
            evict_at,
            observers: 0,
            generation: 0,
            last_error: None,
            fetcher: None,
            options,
        }
    }

    pub fn is_fresh(&self, now: Timestamp) -> bool {
        self.value.is_some()
            && self.status == EntryStatus::Idle
            && self.stale_at.is_some_and(|stale_at| now < stale_at)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.observers == 0
            && self.status != EntryStatus::Fetching
            && self.evict_at.is_some_and(|evict_at| evict_at <= now)
    }

    /// Start a fetch and return the generation its result must match.
    pub fn begin_fetch(&mut self) -> u64 {
        self.generation += 1;
        self.status = EntryStatus::Fetching;
        self.generation
    }

    /// Supersede any in-flight fetch. Returns whether one was running.
    pub fn cancel_fetch(&mut self) -> bool {
        let was_fetching = self.status == EntryStatus::Fetching;
        self.generation += 1;
        if was_fetching {
            self.status = EntryStatus::Stale;
        }
        was_fetching
    }

    /// Settle a fetch whose future was dropped before it finished. Only the
    /// fetch holding `generation` may do this.
    pub fn abandon_fetch(&mut self, generation: u64, now: Timestamp) -> bool {
        if self.generation != generation || self.status != EntryStatus::Fetching {
            return false;
        }
        self.generation += 1;
        self.status = EntryStatus::Stale;
        self.stale_at = None;
        self.touch(now);
        true
    }

    pub fn complete_fetch(&mut self, value: Value, now: Timestamp) {
        self.value = Some(value);
        self.status = EntryStatus::Idle;
        self.fetched_at = Some(now);
        self.updated_at = now;
        self.stale_at = Some(add_saturating(now, self.options.stale_time));
        self.last_error = None;
        self.touch(now);
    }

    pub fn fail_fetch(&mut self, error: DealDeskError, now: Timestamp) {
        self.status = EntryStatus::Error;
        self.last_error = Some(error);
        self.touch(now);
    }

    /// Replace the value outside a fetch. Supersedes in-flight fetches.
    pub fn write(&mut self, value: Value, now: Timestamp) {
        self.generation += 1;
        self.value = Some(value);
        if self.status == EntryStatus::Fetching || self.status == EntryStatus::Error {
            self.status = EntryStatus::Idle;
        }
        self.updated_at = now;
        if self.status == EntryStatus::Idle {
            self.stale_at = Some(add_saturating(now, self.options.stale_time));
        }
        self.touch(now);
    }

    pub fn mark_stale(&mut self) {
        if self.status != EntryStatus::Fetching {
            self.status = EntryStatus::Stale;
        }
        self.stale_at = None;
    }

    pub fn add_observer(&mut self) {
        self.observers += 1;
        self.evict_at = None;
    }

    pub fn remove_observer(&mut self, now: Timestamp) {
        self.observers = self.observers.saturating_sub(1);
        self.touch(now);
    }

    /// Restart the GC timer of an unobserved entry.
    fn touch(&mut self, now: Timestamp) {
        if self.observers == 0 {
            self.evict_at = Some(add_saturating(now, self.options.gc_time));
        }
    }

    pub fn state(&self) -> EntryState {
        EntryState {
            status: self.status,
            has_value: self.value.is_some(),
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
            stale_at: self.stale_at,
            evict_at: self.evict_at,
            observers: self.observers,
            generation: self.generation,
            last_error: self.last_error.clone(),
            has_fetcher: self.fetcher.is_some(),
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("status", &self.status)
            .field("has_value", &self.value.is_some())
            .field("observers", &self.observers)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Introspection snapshot of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryState {
    pub status: EntryStatus,
    pub has_value: bool,
    pub fetched_at: Option<Timestamp>,
    pub updated_at: Timestamp,
    pub stale_at: Option<Timestamp>,
    pub evict_at: Option<Timestamp>,
    pub observers: usize,
    pub generation: u64,
    pub last_error: Option<DealDeskError>,
    pub has_fetcher: bool,
}

/// Result of a query read, carrying where the value came from.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRead<T> {
    value: T,
    updated_at: Timestamp,
    was_cache_hit: bool,
}

impl<T> QueryRead<T> {
    /// A fresh cached value.
    pub fn from_cache(value: T, updated_at: Timestamp) -> Self {
        Self {
            value,
            updated_at,
            was_cache_hit: true,
        }
    }

    /// A value just returned by the fetcher.
    pub fn from_fetch(value: T, updated_at: Timestamp) -> Self {
        Self {
            value,
            updated_at,
            was_cache_hit: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Transform the value, keeping the read metadata.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> QueryRead<U> {
        QueryRead {
            value: f(self.value),
            updated_at: self.updated_at,
            was_cache_hit: self.was_cache_hit,
        }
    }

    /// Fallible transform, keeping the read metadata.
    pub fn try_map<U, E, F: FnOnce(T) -> Result<U, E>>(self, f: F) -> Result<QueryRead<U>, E> {
        Ok(QueryRead {
            value: f(self.value)?,
            updated_at: self.updated_at,
            was_cache_hit: self.was_cache_hit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn options() -> QueryOptions {
        QueryOptions::default()
            .with_stale_time(Duration::from_secs(10))
            .with_gc_time(Duration::from_secs(60))
    }

    #[test]
    fn test_new_entry_is_not_fresh() {
        let now = Utc::now();
        let entry = CacheEntry::new(now, options());
        assert!(!entry.is_fresh(now));
        assert_eq!(entry.evict_at, Some(add_saturating(now, Duration::from_secs(60))));
    }

    #[test]
    fn test_fetched_entry_goes_stale_after_stale_time() {
        let now = Utc::now();
        let mut entry = CacheEntry::new(now, options());
        let generation = entry.begin_fetch();
        assert_eq!(generation, 1);
        entry.complete_fetch(json!([1]), now);

        assert!(entry.is_fresh(now));
        assert!(!entry.is_fresh(add_saturating(now, Duration::from_secs(10))));
    }

    #[test]
    fn test_cancel_bumps_generation() {
        let now = Utc::now();
        let mut entry = CacheEntry::new(now, options());
        let generation = entry.begin_fetch();
        assert!(entry.cancel_fetch());
        assert_ne!(entry.generation, generation);
        assert_eq!(entry.status, EntryStatus::Stale);
        assert!(!entry.cancel_fetch());
    }

    #[test]
    fn test_observed_entries_never_expire() {
        let now = Utc::now();
        let mut entry = CacheEntry::new(now, options());
        entry.add_observer();
        assert!(!entry.is_expired(add_saturating(now, Duration::from_secs(3600))));

        entry.remove_observer(now);
        assert!(!entry.is_expired(add_saturating(now, Duration::from_secs(59))));
        assert!(entry.is_expired(add_saturating(now, Duration::from_secs(60))));
    }

    #[test]
    fn test_mark_stale_keeps_value() {
        let now = Utc::now();
        let mut entry = CacheEntry::new(now, options());
        entry.write(json!({"a": 1}), now);
        entry.mark_stale();
        assert_eq!(entry.status, EntryStatus::Stale);
        assert!(entry.value.is_some());
        assert!(!entry.is_fresh(now));
    }

    #[test]
    fn test_query_read_map() {
        let read = QueryRead::from_cache(2, Utc::now()).map(|n| n * 21);
        assert_eq!(*read.value(), 42);
        assert!(read.was_cache_hit());
    }
}
