//! Rollback controller.
//!
//! Holds the snapshot of every key an optimistic patch touched and settles
//! exactly once: either the snapshots are discarded (commit) or written back
//! (rollback). A key whose value has moved on since this mutation patched it
//! belongs to someone else now and is left alone.

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{PatchedKey, QueryCache, QueryKey};
use crate::events::CacheEvent;
use crate::mutation::MutationId;

/// Lifecycle of one mutation's snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollbackState {
    Armed,
    Committed,
    RolledBack,
}

/// Result of a settle attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Applied,
    /// The controller had already settled; nothing was done.
    AlreadySettled,
}

/// Value of one key before and after the optimistic patch.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: QueryKey,
    pub previous: Value,
    pub optimistic: Value,
}

impl From<PatchedKey> for Snapshot {
    fn from(patched: PatchedKey) -> Self {
        Self {
            key: patched.key,
            previous: patched.previous,
            optimistic: patched.optimistic,
        }
    }
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackOutcome {
    pub transition: Transition,
    /// Keys written back to their previous value.
    pub restored: Vec<QueryKey>,
    /// Keys left alone because a later write replaced the optimistic value.
    pub superseded: Vec<QueryKey>,
}

impl RollbackOutcome {
    fn already_settled() -> Self {
        Self {
            transition: Transition::AlreadySettled,
            restored: Vec::new(),
            superseded: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct RollbackController {
    mutation_id: MutationId,
    cache: QueryCache,
    snapshots: Vec<Snapshot>,
    state: RollbackState,
}

impl RollbackController {
    /// Take ownership of the snapshots produced by an optimistic patch.
    pub(crate) fn arm(cache: QueryCache, mutation_id: MutationId, patched: Vec<PatchedKey>) -> Self {
        let snapshots: Vec<Snapshot> = patched.into_iter().map(Snapshot::from).collect();
        let keys: Vec<QueryKey> = snapshots.iter().map(|s| s.key.clone()).collect();
        debug!(mutation_id = %mutation_id, keys = keys.len(), "Armed rollback controller");
        cache.events().publish(CacheEvent::MutationArmed { mutation_id, keys });
        Self {
            mutation_id,
            cache,
            snapshots,
            state: RollbackState::Armed,
        }
    }

    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    pub fn state(&self) -> RollbackState {
        self.state
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.snapshots.iter().map(|s| s.key.clone()).collect()
    }

    /// Keep the optimistic values and drop the snapshots.
    pub fn commit(&mut self) -> Transition {
        if self.state != RollbackState::Armed {
            return Transition::AlreadySettled;
        }
        self.state = RollbackState::Committed;
        self.snapshots.clear();
        self.cache.events().publish(CacheEvent::MutationCommitted {
            mutation_id: self.mutation_id,
        });
        Transition::Applied
    }

    /// Write every snapshot back whose key still holds this mutation's
    /// optimistic value.
    pub fn rollback(&mut self) -> RollbackOutcome {
        if self.state != RollbackState::Armed {
            return RollbackOutcome::already_settled();
        }
        self.state = RollbackState::RolledBack;

        let mut restored = Vec::new();
        let mut superseded = Vec::new();
        for snapshot in self.snapshots.drain(..) {
            if self
                .cache
                .restore_if(&snapshot.key, &snapshot.optimistic, snapshot.previous)
            {
                restored.push(snapshot.key);
            } else {
                superseded.push(snapshot.key);
            }
        }

        warn!(
            mutation_id = %self.mutation_id,
            restored = restored.len(),
            superseded = superseded.len(),
            "Rolled back optimistic update"
        );
        self.cache.events().publish(CacheEvent::MutationRolledBack {
            mutation_id: self.mutation_id,
            restored: restored.clone(),
            superseded: superseded.clone(),
        });
        RollbackOutcome {
            transition: Transition::Applied,
            restored,
            superseded,
        }
    }
}

impl Drop for RollbackController {
    /// A controller dropped while armed belongs to a mutation that never
    /// settled (its future was cancelled), so its patches are reverted.
    fn drop(&mut self) {
        if self.state == RollbackState::Armed && !self.snapshots.is_empty() {
            warn!(mutation_id = %self.mutation_id, "Mutation abandoned before settling");
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn armed(cache: &QueryCache, key: &QueryKey, previous: Value, optimistic: Value) -> RollbackController {
        cache.set(key, optimistic.clone());
        RollbackController::arm(
            cache.clone(),
            MutationId::new(),
            vec![PatchedKey {
                key: key.clone(),
                previous,
                optimistic,
            }],
        )
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let cache = QueryCache::default();
        let key = QueryKey::connection_requests();
        let mut controller = armed(&cache, &key, json!("pending"), json!("approved"));

        let outcome = controller.rollback();
        assert_eq!(outcome.transition, Transition::Applied);
        assert_eq!(outcome.restored, vec![key.clone()]);
        assert_eq!(cache.get(&key), Some(json!("pending")));
        assert_eq!(controller.state(), RollbackState::RolledBack);
    }

    #[test]
    fn test_settles_exactly_once() {
        let cache = QueryCache::default();
        let key = QueryKey::connection_requests();
        let mut controller = armed(&cache, &key, json!(1), json!(2));

        assert_eq!(controller.commit(), Transition::Applied);
        assert_eq!(controller.commit(), Transition::AlreadySettled);
        assert_eq!(controller.rollback().transition, Transition::AlreadySettled);
        assert_eq!(cache.get(&key), Some(json!(2)));
        assert_eq!(controller.state(), RollbackState::Committed);
    }

    #[test]
    fn test_superseded_key_is_not_restored() {
        let cache = QueryCache::default();
        let key = QueryKey::admin_users();
        let mut controller = armed(&cache, &key, json!("a"), json!("b"));
        cache.set(&key, json!("c"));

        let outcome = controller.rollback();
        assert!(outcome.restored.is_empty());
        assert_eq!(outcome.superseded, vec![key.clone()]);
        assert_eq!(cache.get(&key), Some(json!("c")));
    }

    #[tokio::test]
    async fn test_drop_while_armed_rolls_back_once() {
        let cache = QueryCache::default();
        let key = QueryKey::deals();
        let mut rx = cache.events().subscribe();
        let controller = armed(&cache, &key, json!([]), json!([1]));
        drop(controller);

        assert_eq!(cache.get(&key), Some(json!([])));
        let mut rollbacks = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CacheEvent::MutationRolledBack { .. }) {
                rollbacks += 1;
            }
        }
        assert_eq!(rollbacks, 1);
    }
}
