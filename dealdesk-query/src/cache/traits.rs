//! Fetcher trait and cache statistics.

use async_trait::async_trait;
use dealdesk_core::{CacheError, DealDeskResult};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::QueryKey;

/// Loads the authoritative value for a key.
///
/// The cache remembers the fetcher an entry was populated with, so the
/// invalidation fan-out can refetch observed entries without the call site.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> DealDeskResult<Value>;
}

/// Adapter turning an async closure into a [`QueryFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> QueryFetcher for FnFetcher<F>
where
    F: Fn(QueryKey) -> Fut + Send + Sync,
    Fut: Future<Output = DealDeskResult<Value>> + Send,
{
    async fn fetch(&self, key: &QueryKey) -> DealDeskResult<Value> {
        (self.f)(key.clone()).await
    }
}

/// Wrap a closure returning raw JSON.
pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn QueryFetcher>
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DealDeskResult<Value>> + Send + 'static,
{
    Arc::new(FnFetcher { f })
}

/// Wrap a closure returning a typed value; the result is stored as JSON.
pub fn typed_fetcher<T, F, Fut>(f: F) -> Arc<dyn QueryFetcher>
where
    T: Serialize + Send + 'static,
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DealDeskResult<T>> + Send + 'static,
{
    fetcher_fn(move |key| {
        let fut = f(key);
        async move {
            let value = fut.await?;
            serde_json::to_value(value).map_err(|e| CacheError::from(e).into())
        }
    })
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Fetches answered from a fresh entry.
    pub hits: u64,
    /// Fetches that went to the fetcher.
    pub misses: u64,
    /// Entries currently held.
    pub entries: u64,
    /// Entries removed by garbage collection.
    pub evictions: u64,
    /// Entries marked stale by invalidation.
    pub invalidations: u64,
    /// Fetch results dropped because they were superseded.
    pub cancelled_fetches: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
