//! An in-process, concurrent key/value cache built around three things a
//! plain shared map does not give you:
//!
//! - **Row locks**: any caller can serialize on a key while every other key
//!   proceeds in parallel, so read-modify-write updates compose without a
//!   central writer ([`Cache::update`], [`Cache::isolated`]).
//! - **TTL expiry**: per-entry deadlines with per-item overrides and
//!   optional access-based renewal, driven by a bucketed wheel on a
//!   background tick thread. Scheduling is O(1) and a tick's work is
//!   proportional to what is due, never to the cache size.
//! - **Mutation events**: a listener invoked after inserts and updates and
//!   before deletes, on the mutating caller, inside the lock scope.
//!
//! There is no networking, persistence or eviction policy beyond TTL; the
//! cache lives inside the host process.
//!
//! ```
//! use rowcache::{CacheBuilder, Mutation};
//! use std::time::Duration;
//!
//! let cache = CacheBuilder::<String, u64>::new()
//!   .time_to_live(Duration::from_secs(60))
//!   .build()
//!   .unwrap();
//!
//! cache.put("hits".into(), 1).unwrap();
//! cache
//!   .update(&"hits".into(), |old| match old {
//!     Some(n) => Mutation::Set(n + 1),
//!     None => Mutation::Set(1),
//!   })
//!   .unwrap();
//! assert_eq!(cache.get(&"hits".into()).as_deref(), Some(&2));
//! ```

mod builder;
mod entry;
mod error;
mod handles;
mod listener;
mod lock;
mod metrics;
mod shared;
mod store;
mod task;

pub use builder::CacheBuilder;
pub use entry::{Mutation, Ttl};
pub use error::{BuildError, CacheError, ListenerError};
pub use handles::Cache;
pub use listener::{CacheEvent, CacheListener};
pub use metrics::MetricsSnapshot;
