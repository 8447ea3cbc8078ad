//! The query client handed to every call site.

use dealdesk_core::{ClientConfig, DealDeskError, DealDeskResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{
    Clock, InvalidateOptions, InvalidationReport, KeyFilter, QueryCache, QueryFetcher, QueryKey,
    QueryObserver, QueryOptions, QueryRead, SystemClock,
};
use crate::events::{CacheEvent, EventBus};
use crate::mutation::{MutationExecutor, MutationReport, OptimisticMutation};
use crate::notify::{ErrorNotice, ErrorNotifier, TracingNotifier};
use crate::realtime::{RealtimeBridge, RealtimeTransport};
use crate::retry::RetryPolicy;

/// Cache, executor and notifier bundled with the configured defaults.
///
/// Cloning shares the same cache. There is no global instance; construct one
/// per session and pass it to whatever needs it.
#[derive(Clone, Debug)]
pub struct QueryClient {
    cache: QueryCache,
    executor: MutationExecutor,
    config: ClientConfig,
}

impl QueryClient {
    /// Client on the system clock that reports failures through `tracing`.
    pub fn from_config(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(TracingNotifier))
    }

    pub fn new(config: ClientConfig, notifier: Arc<dyn ErrorNotifier>) -> Self {
        Self::with_clock(config, notifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ClientConfig,
        notifier: Arc<dyn ErrorNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let defaults = QueryOptions::from_config(&config.query, RetryPolicy::from_config(&config.retry));
        let events = EventBus::new(config.realtime.event_buffer);
        let cache = QueryCache::with_parts(defaults, clock, events);
        let executor = MutationExecutor::new(cache.clone(), notifier, config.mutation.clone());
        Self {
            cache,
            executor,
            config,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn executor(&self) -> &MutationExecutor {
        &self.executor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<dyn ErrorNotifier> {
        self.executor.notifier()
    }

    /// Subscribe to cache, mutation and realtime events.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.cache.events().subscribe()
    }

    /// Configured per-query defaults.
    pub fn query_options(&self) -> QueryOptions {
        self.cache.defaults().clone()
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn query(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> DealDeskResult<QueryRead<Value>> {
        self.cache.fetch(key, fetcher, self.cache.defaults()).await
    }

    pub async fn query_with(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
        options: &QueryOptions,
    ) -> DealDeskResult<QueryRead<Value>> {
        self.cache.fetch(key, fetcher, options).await
    }

    /// Typed read; returns just the value.
    pub async fn query_data<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> DealDeskResult<T> {
        let read = self
            .cache
            .fetch_data::<T>(key, fetcher, self.cache.defaults())
            .await?;
        Ok(read.into_value())
    }

    pub fn observe(&self, key: &QueryKey) -> QueryObserver {
        self.cache.observe(key)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn mutate<V, R>(&self, mutation: &OptimisticMutation<V, R>, variables: V) -> DealDeskResult<R>
    where
        V: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.executor.execute(mutation, variables).await
    }

    pub async fn mutate_detailed<V, R>(
        &self,
        mutation: &OptimisticMutation<V, R>,
        variables: V,
    ) -> MutationReport<R>
    where
        V: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.executor.execute_detailed(mutation, variables).await
    }

    pub async fn invalidate_many(
        &self,
        filters: &[KeyFilter],
        options: InvalidateOptions,
    ) -> InvalidationReport {
        self.cache.invalidate_many(filters, options).await
    }

    /// Surface a failure that happened outside a mutation.
    pub fn notify(&self, context: impl Into<String>, error: DealDeskError) {
        self.notifier().notify(ErrorNotice::new(context, error));
    }

    // ========================================================================
    // BACKGROUND WORK
    // ========================================================================

    /// Bridge realtime changes from `transport` into this client's cache.
    pub fn realtime(&self, transport: Arc<dyn RealtimeTransport>) -> RealtimeBridge {
        RealtimeBridge::new(self.cache.clone(), transport)
    }

    /// Start periodic garbage collection at the configured interval.
    pub fn start_gc(&self) -> JoinHandle<()> {
        self.cache.spawn_gc(self.config.query.gc_interval())
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::from_config(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{typed_fetcher, ManualClock};
    use std::time::Duration;

    #[tokio::test]
    async fn test_query_data_uses_configured_stale_time() {
        let mut config = ClientConfig::default();
        config.query.stale_time_ms = 60_000;
        let clock = Arc::new(ManualClock::starting_now());
        let client = QueryClient::with_clock(config, Arc::new(TracingNotifier), clock.clone());

        let key = QueryKey::deals();
        let names: Vec<String> = client
            .query_data(&key, typed_fetcher(|_| async { Ok(vec!["alpha".to_string()]) }))
            .await
            .expect("query");
        assert_eq!(names, vec!["alpha".to_string()]);

        let read = client
            .query(&key, typed_fetcher(|_| async { Ok(vec!["beta".to_string()]) }))
            .await
            .expect("query");
        assert!(read.was_cache_hit());

        clock.advance(Duration::from_secs(61));
        let read = client
            .query(&key, typed_fetcher(|_| async { Ok(vec!["beta".to_string()]) }))
            .await
            .expect("query");
        assert!(!read.was_cache_hit());
    }

    #[test]
    fn test_defaults_follow_config() {
        let client = QueryClient::default();
        let options = client.query_options();
        assert_eq!(options.gc_time, Duration::from_secs(300));
        assert_eq!(options.retry.max_retries, 3);
    }
}
