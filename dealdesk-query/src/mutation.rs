//! Optimistic mutations.
//!
//! An [`OptimisticMutation`] bundles a remote write with the patches that
//! predict its effect on cached data and the key filters it invalidates. The
//! [`MutationExecutor`] runs one to completion:
//!
//! 1. supersede in-flight fetches for every touched key
//! 2. apply the optimistic patches and arm the rollback controller
//! 3. call the remote write exactly once
//! 4. commit on success, roll back on failure
//! 5. publish `MutationSettled`
//! 6. run the invalidation fan-out (after failures too, unless opted out)
//! 7. publish `MutationSucceeded` or `MutationFailed`, notifying on failure
//!
//! Mutations are never retried.

use async_trait::async_trait;
use dealdesk_core::{CacheError, DealDeskError, DealDeskResult, EntityIdType, MutationConfig};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{InvalidationReport, KeyFilter, QueryCache, QueryKey};
use crate::events::CacheEvent;
use crate::invalidation::FanOut;
use crate::notify::{ErrorNotice, ErrorNotifier};
use crate::rollback::{RollbackController, RollbackOutcome};

/// Identifier of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIdType for MutationId {
    fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// REMOTE WRITE
// ============================================================================

/// The remote write of a mutation.
#[async_trait]
pub trait MutationFn<V, R>: Send + Sync {
    async fn call(&self, variables: &V) -> DealDeskResult<R>;
}

/// Adapter turning an async closure into a [`MutationFn`].
pub struct MutateFn<F> {
    f: F,
}

#[async_trait]
impl<V, R, F, Fut> MutationFn<V, R> for MutateFn<F>
where
    V: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(V) -> Fut + Send + Sync,
    Fut: Future<Output = DealDeskResult<R>> + Send,
{
    async fn call(&self, variables: &V) -> DealDeskResult<R> {
        (self.f)(variables.clone()).await
    }
}

// ============================================================================
// OPTIMISTIC PATCHES
// ============================================================================

type PatchFn<V> = dyn Fn(&QueryKey, &Value, &V) -> Option<Value> + Send + Sync;

/// Pure prediction of a write's effect on the entries matching a filter.
///
/// Patches never see an absent value: keys without a value are skipped.
pub struct OptimisticPatch<V> {
    target: KeyFilter,
    apply: Arc<PatchFn<V>>,
}

impl<V: 'static> OptimisticPatch<V> {
    /// Patch cached values of type `T`.
    ///
    /// A value that does not deserialize into `T` is left unchanged.
    pub fn typed<T, F>(target: KeyFilter, f: F) -> Self
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T, &V) -> T + Send + Sync + 'static,
    {
        Self::keyed(target, move |_key: &QueryKey, current: &T, variables: &V| {
            f(current, variables)
        })
    }

    /// Like [`typed`](Self::typed), for predictions that depend on the key,
    /// such as the status a list is filtered by.
    pub fn keyed<T, F>(target: KeyFilter, f: F) -> Self
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&QueryKey, &T, &V) -> T + Send + Sync + 'static,
    {
        let apply = move |key: &QueryKey, value: &Value, variables: &V| {
            let current: T = match serde_json::from_value(value.clone()) {
                Ok(current) => current,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping optimistic patch on unexpected shape");
                    return None;
                }
            };
            match serde_json::to_value(f(key, &current, variables)) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(key = %key, error = %e, "Optimistic patch produced unserializable value");
                    None
                }
            }
        };
        Self {
            target,
            apply: Arc::new(apply),
        }
    }

    /// Patch raw JSON values.
    pub fn raw<F>(target: KeyFilter, f: F) -> Self
    where
        F: Fn(&Value, &V) -> Value + Send + Sync + 'static,
    {
        Self {
            target,
            apply: Arc::new(move |_key: &QueryKey, value: &Value, variables: &V| {
                Some(f(value, variables))
            }),
        }
    }

    pub fn target(&self) -> &KeyFilter {
        &self.target
    }

    pub fn apply(&self, key: &QueryKey, value: &Value, variables: &V) -> Option<Value> {
        if !self.target.matches(key) {
            return None;
        }
        (self.apply)(key, value, variables)
    }
}

impl<V> Clone for OptimisticPatch<V> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<V> fmt::Debug for OptimisticPatch<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticPatch")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// MUTATION DEFINITION
// ============================================================================

/// A remote write with its optimistic patches and invalidation fan-out.
pub struct OptimisticMutation<V, R> {
    name: String,
    mutate: Arc<dyn MutationFn<V, R>>,
    patches: Vec<OptimisticPatch<V>>,
    invalidates: Vec<KeyFilter>,
    invalidate_on_error: Option<bool>,
    refetch_active: Option<bool>,
}

impl<V, R> OptimisticMutation<V, R>
where
    V: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn builder(name: impl Into<String>) -> MutationBuilder<V, R> {
        MutationBuilder {
            name: name.into(),
            mutate: None,
            patches: Vec::new(),
            invalidates: Vec::new(),
            invalidate_on_error: None,
            refetch_active: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patches(&self) -> &[OptimisticPatch<V>] {
        &self.patches
    }

    pub fn invalidates(&self) -> &[KeyFilter] {
        &self.invalidates
    }

    /// Apply every patch matching `key` in declaration order.
    ///
    /// Returns `None` when no patch changed the value.
    pub fn predict(&self, key: &QueryKey, value: &Value, variables: &V) -> Option<Value> {
        let mut current: Option<Value> = None;
        for patch in &self.patches {
            let base = current.as_ref().unwrap_or(value);
            if let Some(next) = patch.apply(key, base, variables) {
                current = Some(next);
            }
        }
        current.filter(|next| next != value)
    }
}

impl<V, R> fmt::Debug for OptimisticMutation<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticMutation")
            .field("name", &self.name)
            .field("patches", &self.patches)
            .field("invalidates", &self.invalidates)
            .field("invalidate_on_error", &self.invalidate_on_error)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OptimisticMutation`].
pub struct MutationBuilder<V, R> {
    name: String,
    mutate: Option<Arc<dyn MutationFn<V, R>>>,
    patches: Vec<OptimisticPatch<V>>,
    invalidates: Vec<KeyFilter>,
    invalidate_on_error: Option<bool>,
    refetch_active: Option<bool>,
}

impl<V, R> MutationBuilder<V, R>
where
    V: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn mutate(mut self, mutate: Arc<dyn MutationFn<V, R>>) -> Self {
        self.mutate = Some(mutate);
        self
    }

    /// Use an async closure as the remote write.
    pub fn mutate_with<F, Fut>(self, f: F) -> Self
    where
        V: Clone,
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DealDeskResult<R>> + Send + 'static,
    {
        self.mutate(Arc::new(MutateFn { f }))
    }

    pub fn patch(mut self, patch: OptimisticPatch<V>) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn invalidates(mut self, filter: KeyFilter) -> Self {
        self.invalidates.push(filter);
        self
    }

    /// Whether the fan-out runs after a failed write. Defaults to the
    /// executor's `MutationConfig`.
    pub fn invalidate_on_error(mut self, enabled: bool) -> Self {
        self.invalidate_on_error = Some(enabled);
        self
    }

    pub fn refetch_active(mut self, enabled: bool) -> Self {
        self.refetch_active = Some(enabled);
        self
    }

    /// Every patched filter must be covered by an invalidated filter, so each
    /// optimistic value is eventually replaced by server data.
    pub fn build(self) -> Result<OptimisticMutation<V, R>, CacheError> {
        let mutate = self.mutate.ok_or_else(|| CacheError::InvalidMutation {
            reason: format!("mutation '{}' has no remote write", self.name),
        })?;
        for patch in &self.patches {
            let covered = self
                .invalidates
                .iter()
                .any(|filter| patch.target().is_covered_by(filter));
            if !covered {
                return Err(CacheError::InvalidMutation {
                    reason: format!(
                        "mutation '{}' patches {} but never invalidates it",
                        self.name,
                        patch.target()
                    ),
                });
            }
        }
        Ok(OptimisticMutation {
            name: self.name,
            mutate,
            patches: self.patches,
            invalidates: self.invalidates,
            invalidate_on_error: self.invalidate_on_error,
            refetch_active: self.refetch_active,
        })
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Everything one `execute` call did.
#[derive(Debug)]
pub struct MutationReport<R> {
    pub mutation_id: MutationId,
    pub result: DealDeskResult<R>,
    /// Keys the optimistic phase changed.
    pub patched: Vec<QueryKey>,
    /// Present when the write failed.
    pub rollback: Option<RollbackOutcome>,
    /// Absent when the fan-out was skipped.
    pub invalidation: Option<InvalidationReport>,
}

impl<R> MutationReport<R> {
    /// A mutation refused before any cache write or remote call.
    pub fn rejected(error: DealDeskError) -> Self {
        Self {
            mutation_id: MutationId::new(),
            result: Err(error),
            patched: Vec::new(),
            rollback: None,
            invalidation: None,
        }
    }
}

/// Runs optimistic mutations against a shared cache.
#[derive(Clone)]
pub struct MutationExecutor {
    cache: QueryCache,
    notifier: Arc<dyn ErrorNotifier>,
    defaults: MutationConfig,
}

impl MutationExecutor {
    pub fn new(cache: QueryCache, notifier: Arc<dyn ErrorNotifier>, defaults: MutationConfig) -> Self {
        Self {
            cache,
            notifier,
            defaults,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn notifier(&self) -> &Arc<dyn ErrorNotifier> {
        &self.notifier
    }

    /// Run `mutation` and return the remote write's result.
    pub async fn execute<V, R>(&self, mutation: &OptimisticMutation<V, R>, variables: V) -> DealDeskResult<R>
    where
        V: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.execute_detailed(mutation, variables).await.result
    }

    /// Run `mutation` and report every phase.
    pub async fn execute_detailed<V, R>(
        &self,
        mutation: &OptimisticMutation<V, R>,
        variables: V,
    ) -> MutationReport<R>
    where
        V: Send + Sync + 'static,
        R: Send + 'static,
    {
        let mutation_id = MutationId::new();
        let events = self.cache.events().clone();
        info!(mutation = %mutation.name, mutation_id = %mutation_id, "Executing mutation");

        for filter in mutation
            .patches
            .iter()
            .map(OptimisticPatch::target)
            .chain(mutation.invalidates.iter())
        {
            let cancelled = self.cache.cancel_matching(filter);
            if !cancelled.is_empty() {
                debug!(mutation_id = %mutation_id, filter = %filter, cancelled = cancelled.len(), "Cancelled in-flight fetches");
            }
        }

        let patched = self
            .cache
            .patch_all(|key, value| mutation.predict(key, value, &variables));
        let patched_keys: Vec<QueryKey> = patched.iter().map(|p| p.key.clone()).collect();
        let mut controller = RollbackController::arm(self.cache.clone(), mutation_id, patched);

        let result = mutation.mutate.call(&variables).await;

        let rollback = match &result {
            Ok(_) => {
                controller.commit();
                None
            }
            Err(err) => {
                warn!(mutation = %mutation.name, mutation_id = %mutation_id, error = %err, "Mutation write failed");
                Some(controller.rollback())
            }
        };
        events.publish(CacheEvent::MutationSettled {
            mutation_id,
            success: result.is_ok(),
        });

        let invalidate_on_error = mutation
            .invalidate_on_error
            .unwrap_or(self.defaults.invalidate_on_error);
        let refetch_active = mutation
            .refetch_active
            .unwrap_or(self.defaults.refetch_active);
        let invalidation = if result.is_ok() || invalidate_on_error {
            let fan_out = FanOut::new(mutation.invalidates.iter().cloned())
                .with_refetch_active(refetch_active);
            Some(fan_out.run(&self.cache).await)
        } else {
            None
        };

        match &result {
            Ok(_) => {
                info!(mutation = %mutation.name, mutation_id = %mutation_id, "Mutation succeeded");
                events.publish(CacheEvent::MutationSucceeded { mutation_id });
            }
            Err(err) => {
                events.publish(CacheEvent::MutationFailed {
                    mutation_id,
                    error: err.clone(),
                });
                self.notifier.notify(
                    ErrorNotice::new(mutation.name.clone(), err.clone()).with_mutation(mutation_id),
                );
            }
        }

        MutationReport {
            mutation_id,
            result,
            patched: patched_keys,
            rollback,
            invalidation,
        }
    }
}

impl fmt::Debug for MutationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationExecutor")
            .field("cache", &self.cache)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{fetcher_fn, EntryStatus, QueryScope};
    use crate::notify::TracingNotifier;
    use crate::rollback::Transition;
    use dealdesk_core::{ConflictError, DealDeskError, TableName};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<ErrorNotice>>);

    impl ErrorNotifier for Collecting {
        fn notify(&self, notice: ErrorNotice) {
            self.0.lock().unwrap().push(notice);
        }
    }

    fn conflict() -> DealDeskError {
        ConflictError::WriteRejected {
            table: TableName::Deals,
            id: "1".to_string(),
            reason: "locked".to_string(),
        }
        .into()
    }

    fn counter_mutation(fail: bool, calls: Arc<AtomicU32>) -> OptimisticMutation<i64, i64> {
        OptimisticMutation::builder("increment")
            .mutate_with(move |by: i64| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if fail {
                        Err(conflict())
                    } else {
                        Ok(by)
                    }
                }
            })
            .patch(OptimisticPatch::typed(
                QueryKey::deals().prefix(),
                |count: &i64, by: &i64| count + by,
            ))
            .invalidates(QueryKey::deals().prefix())
            .build()
            .expect("valid mutation")
    }

    fn executor(cache: &QueryCache, notifier: Arc<dyn ErrorNotifier>) -> MutationExecutor {
        MutationExecutor::new(cache.clone(), notifier, MutationConfig::default())
    }

    #[test]
    fn test_build_requires_remote_write() {
        let err = OptimisticMutation::<(), ()>::builder("noop").build().unwrap_err();
        assert!(matches!(err, CacheError::InvalidMutation { .. }));
    }

    #[test]
    fn test_build_rejects_patch_without_invalidation() {
        let err = OptimisticMutation::<i64, ()>::builder("orphan")
            .mutate_with(|_| async { Ok(()) })
            .patch(OptimisticPatch::raw(QueryKey::deals().prefix(), |v, _| v.clone()))
            .invalidates(QueryKey::admin_users().prefix())
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidMutation { ref reason } if reason.contains("deals")));
    }

    #[test]
    fn test_predict_composes_patches_and_skips_noops() {
        let mutation = OptimisticMutation::<i64, ()>::builder("double")
            .mutate_with(|_| async { Ok(()) })
            .patch(OptimisticPatch::typed(KeyFilter::Scope(QueryScope::Deals), |n: &i64, by: &i64| n + by))
            .patch(OptimisticPatch::typed(KeyFilter::Scope(QueryScope::Deals), |n: &i64, _: &i64| n * 2))
            .invalidates(KeyFilter::Scope(QueryScope::Deals))
            .build()
            .expect("valid");

        assert_eq!(mutation.predict(&QueryKey::deals(), &json!(1), &1), Some(json!(4)));
        assert_eq!(mutation.predict(&QueryKey::deals(), &json!(0), &0), None);
        assert_eq!(mutation.predict(&QueryKey::admin_users(), &json!(1), &1), None);
    }

    #[test]
    fn test_typed_patch_skips_wrong_shape() {
        let patch = OptimisticPatch::typed(KeyFilter::All, |n: &i64, by: &i64| n + by);
        assert_eq!(patch.apply(&QueryKey::deals(), &json!("text"), &1), None);
    }

    #[tokio::test]
    async fn test_success_keeps_optimistic_value_and_invalidates() {
        let cache = QueryCache::default();
        let key = QueryKey::deals();
        cache.set(&key, json!(10));
        let calls = Arc::new(AtomicU32::new(0));

        let report = executor(&cache, Arc::new(TracingNotifier))
            .execute_detailed(&counter_mutation(false, calls.clone()), 5)
            .await;

        assert_eq!(report.result, Ok(5));
        assert_eq!(report.patched, vec![key.clone()]);
        assert!(report.rollback.is_none());
        assert_eq!(
            report.invalidation.map(|r| r.invalidated),
            Some(vec![key.clone()])
        );
        assert_eq!(cache.get(&key), Some(json!(15)));
        assert_eq!(cache.entry_state(&key).map(|s| s.status), Some(EntryStatus::Stale));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_and_notifies() {
        let cache = QueryCache::default();
        let key = QueryKey::deals();
        cache.set(&key, json!(10));
        let notifier = Arc::new(Collecting::default());
        let calls = Arc::new(AtomicU32::new(0));

        let report = executor(&cache, notifier.clone())
            .execute_detailed(&counter_mutation(true, calls.clone()), 5)
            .await;

        assert_eq!(report.result, Err(conflict()));
        let rollback = report.rollback.expect("rolled back");
        assert_eq!(rollback.transition, Transition::Applied);
        assert_eq!(rollback.restored, vec![key.clone()]);
        assert!(report.invalidation.is_some());
        assert_eq!(cache.get(&key), Some(json!(10)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let notices = notifier.0.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].mutation_id, Some(report.mutation_id));
    }

    #[tokio::test]
    async fn test_opting_out_of_error_invalidation() {
        let cache = QueryCache::default();
        cache.set(&QueryKey::deals(), json!(1));
        let mutation = OptimisticMutation::<i64, ()>::builder("fail")
            .mutate_with(|_| async { Err(conflict()) })
            .invalidates(QueryKey::deals().prefix())
            .invalidate_on_error(false)
            .build()
            .expect("valid");

        let report = executor(&cache, Arc::new(TracingNotifier))
            .execute_detailed(&mutation, 1)
            .await;
        assert!(report.invalidation.is_none());
        assert_eq!(
            cache.entry_state(&QueryKey::deals()).map(|s| s.status),
            Some(EntryStatus::Idle)
        );
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let cache = QueryCache::default();
        cache.set(&QueryKey::deals(), json!(0));
        let mut rx = cache.events().subscribe();

        let _ = executor(&cache, Arc::new(TracingNotifier))
            .execute(&counter_mutation(true, Arc::new(AtomicU32::new(0))), 1)
            .await;

        let mut lifecycle = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.mutation_id().is_some() {
                lifecycle.push(event.event_type());
            }
        }
        assert_eq!(
            lifecycle,
            vec![
                "MutationArmed",
                "MutationRolledBack",
                "MutationSettled",
                "MutationFailed"
            ]
        );
    }

    #[tokio::test]
    async fn test_refetch_after_success_reaches_observed_keys() {
        let cache = QueryCache::default();
        let key = QueryKey::deals();
        let server = Arc::new(AtomicU32::new(100));
        let fetch_server = server.clone();
        cache
            .fetch(
                &key,
                fetcher_fn(move |_| {
                    let value = fetch_server.load(Ordering::SeqCst);
                    async move { Ok(json!(value)) }
                }),
                cache.defaults(),
            )
            .await
            .expect("fetch");
        let _observer = cache.observe(&key);

        let write_server = server.clone();
        let mutation = OptimisticMutation::<u32, ()>::builder("set")
            .mutate_with(move |value: u32| {
                write_server.store(value, Ordering::SeqCst);
                async { Ok(()) }
            })
            .patch(OptimisticPatch::typed(QueryKey::deals().prefix(), |_: &u32, v: &u32| *v))
            .invalidates(QueryKey::deals().prefix())
            .build()
            .expect("valid");

        let report = executor(&cache, Arc::new(TracingNotifier))
            .execute_detailed(&mutation, 7)
            .await;
        assert_eq!(report.invalidation.map(|r| r.refetched), Some(vec![key.clone()]));
        assert_eq!(cache.get(&key), Some(json!(7)));
    }
}
