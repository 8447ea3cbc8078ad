//! Query cache keyed by strongly-typed query keys.
//!
//! The cache is the single source of truth for server state on the client.
//! Every read, optimistic write, rollback and refetch goes through it, and
//! every write is serialized by its lock.
//!
//! # Staleness
//!
//! A fetched value is fresh for `stale_time`, then the next [`QueryCache::fetch`]
//! goes back to the fetcher. Invalidation marks entries stale immediately and
//! refetches the ones that have live [`QueryObserver`]s.
//!
//! # Garbage collection
//!
//! An entry with no observers is evicted `gc_time` after its last write or
//! after its last observer went away. Collection runs lazily on reads and
//! periodically from [`QueryCache::spawn_gc`].
//!
//! # Example
//!
//! ```ignore
//! let key = QueryKey::connection_requests().with_page(1, 50);
//! let read = cache.fetch(&key, fetcher, &QueryOptions::default()).await?;
//! let _observer = cache.observe(&key);
//! cache.invalidate(&QueryKey::connection_requests().prefix(), InvalidateOptions::default()).await;
//! ```

pub mod clock;
pub mod entry;
pub mod key;
pub mod store;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{EntryState, EntryStatus, QueryOptions, QueryRead};
pub use key::{KeyFilter, KeyPart, QueryKey, QueryScope};
pub use store::{InvalidateOptions, InvalidationReport, QueryCache, QueryObserver};
pub use traits::{fetcher_fn, typed_fetcher, CacheStats, FnFetcher, QueryFetcher};

pub(crate) use store::PatchedKey;
