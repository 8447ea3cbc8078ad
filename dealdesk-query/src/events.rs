//! Cache event bus.
//!
//! Every state change the protocol makes is published here: cache writes,
//! invalidations, mutation lifecycle transitions and realtime channel
//! changes. Subscribers are UI layers, tests and diagnostics.

use dealdesk_core::{DealDeskError, TableName};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::QueryKey;
use crate::mutation::MutationId;

/// What caused a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// Direct `set` / `update` by a caller.
    Set,
    /// A fetch result.
    Fetch,
    /// An optimistic patch.
    Optimistic,
    /// Restored from a rollback snapshot.
    Rollback,
}

/// Event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    // ========================================================================
    // CACHE ENTRY EVENTS
    // ========================================================================
    EntryUpdated {
        key: QueryKey,
        source: UpdateSource,
    },

    EntryInvalidated {
        key: QueryKey,
    },

    EntryEvicted {
        key: QueryKey,
    },

    /// A fetch result was dropped because a newer write or fetch superseded it.
    FetchCancelled {
        key: QueryKey,
    },

    // ========================================================================
    // MUTATION EVENTS
    // ========================================================================
    /// Optimistic patches applied and snapshots taken.
    MutationArmed {
        mutation_id: MutationId,
        keys: Vec<QueryKey>,
    },

    MutationCommitted {
        mutation_id: MutationId,
    },

    MutationRolledBack {
        mutation_id: MutationId,
        restored: Vec<QueryKey>,
        superseded: Vec<QueryKey>,
    },

    /// The remote write finished, successfully or not.
    MutationSettled {
        mutation_id: MutationId,
        success: bool,
    },

    MutationSucceeded {
        mutation_id: MutationId,
    },

    MutationFailed {
        mutation_id: MutationId,
        #[serde(serialize_with = "serialize_error")]
        error: DealDeskError,
    },

    // ========================================================================
    // REALTIME EVENTS
    // ========================================================================
    ChannelSubscribed {
        channel: String,
    },

    ChannelDisconnected {
        channel: String,
    },

    /// A change payload on `channel` invalidated `keys` cache entries.
    RealtimeInvalidated {
        channel: String,
        table: TableName,
        keys: usize,
    },
}

impl CacheEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::EntryUpdated { .. } => "EntryUpdated",
            CacheEvent::EntryInvalidated { .. } => "EntryInvalidated",
            CacheEvent::EntryEvicted { .. } => "EntryEvicted",
            CacheEvent::FetchCancelled { .. } => "FetchCancelled",
            CacheEvent::MutationArmed { .. } => "MutationArmed",
            CacheEvent::MutationCommitted { .. } => "MutationCommitted",
            CacheEvent::MutationRolledBack { .. } => "MutationRolledBack",
            CacheEvent::MutationSettled { .. } => "MutationSettled",
            CacheEvent::MutationSucceeded { .. } => "MutationSucceeded",
            CacheEvent::MutationFailed { .. } => "MutationFailed",
            CacheEvent::ChannelSubscribed { .. } => "ChannelSubscribed",
            CacheEvent::ChannelDisconnected { .. } => "ChannelDisconnected",
            CacheEvent::RealtimeInvalidated { .. } => "RealtimeInvalidated",
        }
    }

    /// The mutation this event belongs to, if it is a mutation event.
    pub fn mutation_id(&self) -> Option<MutationId> {
        match self {
            CacheEvent::MutationArmed { mutation_id, .. }
            | CacheEvent::MutationCommitted { mutation_id }
            | CacheEvent::MutationRolledBack { mutation_id, .. }
            | CacheEvent::MutationSettled { mutation_id, .. }
            | CacheEvent::MutationSucceeded { mutation_id }
            | CacheEvent::MutationFailed { mutation_id, .. } => Some(*mutation_id),
            _ => None,
        }
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &DealDeskError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&error.to_string())
}

/// Broadcast channel shared by the cache, the executor and the realtime bridge.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: CacheEvent) -> usize {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(event_type = event_type, receivers = receivers, "Published cache event");
                receivers
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let delivered = bus.publish(CacheEvent::EntryInvalidated {
            key: QueryKey::deals(),
        });
        assert_eq!(delivered, 1);

        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type(), "EntryInvalidated");
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(CacheEvent::ChannelSubscribed {
            channel: "profiles".to_string()
        }), 0);
    }

    #[test]
    fn test_mutation_id_extraction() {
        let id = MutationId::new();
        let event = CacheEvent::MutationSettled {
            mutation_id: id,
            success: true,
        };
        assert_eq!(event.mutation_id(), Some(id));
        assert_eq!(
            CacheEvent::EntryEvicted {
                key: QueryKey::deals()
            }
            .mutation_id(),
            None
        );
    }

    #[test]
    fn test_failed_event_serializes_error_message() {
        let event = CacheEvent::MutationFailed {
            mutation_id: MutationId::new(),
            error: DealDeskError::from(dealdesk_core::AuthError::SessionExpired),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "MutationFailed");
        assert!(json["error"].as_str().unwrap_or_default().contains("Session expired"));
    }
}
