//! DealDesk Query - Optimistic Mutation Protocol
//!
//! Client-side server-state management for the DealDesk admin tools:
//!
//! - [`cache`]: keyed query cache with staleness, observers and GC
//! - [`mutation`]: optimistic mutations and their executor
//! - [`rollback`]: snapshot and restore of optimistically patched keys
//! - [`invalidation`]: the post-write fan-out
//! - [`realtime`]: change-feed driven invalidation
//! - [`client`]: the [`QueryClient`] bundling all of the above
//!
//! A mutation patches the cache before its remote write runs, rolls the
//! patch back if the write fails, and always finishes by invalidating the
//! keys it declared so that server data replaces every prediction.

pub mod cache;
pub mod client;
pub mod events;
pub mod invalidation;
pub mod mutation;
pub mod notify;
pub mod realtime;
pub mod retry;
pub mod rollback;

pub use cache::{
    fetcher_fn, typed_fetcher, CacheStats, Clock, EntryState, EntryStatus, InvalidateOptions,
    InvalidationReport, KeyFilter, KeyPart, ManualClock, QueryCache, QueryFetcher, QueryKey,
    QueryObserver, QueryOptions, QueryRead, QueryScope, SystemClock,
};
pub use client::QueryClient;
pub use events::{CacheEvent, EventBus, UpdateSource};
pub use invalidation::{dedupe_filters, FanOut};
pub use mutation::{
    MutateFn, MutationBuilder, MutationExecutor, MutationFn, MutationId, MutationReport,
    OptimisticMutation, OptimisticPatch,
};
pub use notify::{ErrorNotice, ErrorNotifier, TracingNotifier};
pub use realtime::{
    ChangeEvent, ChangeFilter, ChangePayload, ChannelSpec, ChannelState, RealtimeBridge,
    RealtimeTransport, SubscriptionHandle,
};
pub use retry::{retry_read, RetryPolicy};
pub use rollback::{RollbackController, RollbackOutcome, RollbackState, Snapshot, Transition};
