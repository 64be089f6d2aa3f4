use crate::error::BuildError;
use crate::handles::Cache;
use crate::listener::CacheListener;
use crate::lock::LockPool;
use crate::metrics::Metrics;
use crate::shared::CacheShared;
use crate::store::ShardedStore;
use crate::task::janitor::{Janitor, JanitorContext};

use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

use fibre::mpsc;

/// The tick used when a lifetime feature is enabled without an explicit
/// [`tick_interval`](CacheBuilder::tick_interval).
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A builder for creating [`Cache`] instances.
pub struct CacheBuilder<K: Send, V: Send, H = ahash::RandomState> {
  shards: usize,
  lock_shards: usize,
  time_to_live: Option<Duration>,
  tick_interval: Option<Duration>,
  touch_on_read: bool,
  acquire_timeout: Duration,
  listener: Option<Arc<dyn CacheListener<K, V>>>,
  hasher: H,
}

impl<K: Send, V: Send, H> fmt::Debug for CacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("shards", &self.shards)
      .field("lock_shards", &self.lock_shards)
      .field("time_to_live", &self.time_to_live)
      .field("tick_interval", &self.tick_interval)
      .field("touch_on_read", &self.touch_on_read)
      .field("acquire_timeout", &self.acquire_timeout)
      .field("has_listener", &self.listener.is_some())
      .finish_non_exhaustive()
  }
}

// --- General Configuration Methods ---
impl<K: Send, V: Send, H> CacheBuilder<K, V, H> {
  /// Sets the number of store shards. Rounded up to a power of two.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards.max(1).next_power_of_two();
    self
  }

  /// Sets the number of row-lock shards. Rounded up to a power of two.
  ///
  /// Defaults to the hardware parallelism.
  pub fn lock_shards(mut self, shards: usize) -> Self {
    self.lock_shards = shards.max(1).next_power_of_two();
    self
  }

  /// Sets the default lifetime for entries. A zero duration means entries
  /// never expire, which is also the default.
  pub fn time_to_live(mut self, duration: Duration) -> Self {
    self.time_to_live = Some(duration);
    self
  }

  /// Sets the expiry tick length. Deadlines are rounded up to whole ticks,
  /// so an entry written with lifetime `ttl` is removed between `ttl` and
  /// roughly `ttl` plus two ticks later. A zero duration disables expiry
  /// entirely.
  ///
  /// Per-item lifetimes need a running tick, so configure this (or a
  /// default [`time_to_live`](Self::time_to_live), which implies a 1 s
  /// tick) when using the `*_with_ttl` operations. Ticks of a second or
  /// more keep the janitor's queue churn negligible.
  pub fn tick_interval(mut self, duration: Duration) -> Self {
    self.tick_interval = Some(duration);
    self
  }

  /// When set, reads refresh the entry's deadline to the default lifetime,
  /// like [`touch`](Cache::touch).
  pub fn touch_on_read(mut self, touch: bool) -> Self {
    self.touch_on_read = touch;
    self
  }

  /// Sets how long mutating operations wait for a contended row lock
  /// before failing with
  /// [`CacheError::LockTimeout`](crate::CacheError::LockTimeout).
  ///
  /// Defaults to 5 seconds.
  pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
    self.acquire_timeout = timeout;
    self
  }

  /// Sets the mutation listener for the cache.
  pub fn listener<L>(mut self, listener: L) -> Self
  where
    L: CacheListener<K, V> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }
}

// --- Default Constructor ---
impl<K: Send, V: Send, H: BuildHasher + Default> CacheBuilder<K, V, H> {
  /// Creates a new `CacheBuilder` with default settings.
  pub fn new() -> Self {
    Self {
      shards: (num_cpus::get() * 4).max(1).next_power_of_two(),
      lock_shards: num_cpus::get().max(1).next_power_of_two(),
      time_to_live: None,
      tick_interval: None,
      touch_on_read: false,
      acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
      listener: None,
      hasher: H::default(),
    }
  }
}

impl<K: Send, V: Send> Default for CacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

// --- Build ---
impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Sets the hasher for the store.
  pub fn hasher(mut self, hasher: H) -> Self {
    self.hasher = hasher;
    self
  }

  /// Builds the cache, spawning the janitor thread when expiry is enabled.
  pub fn build(self) -> Result<Cache<K, V, H>, BuildError> {
    self.validate()?;

    let store = Arc::new(ShardedStore::new(self.shards, self.hasher.clone()));
    let locks = Arc::new(LockPool::new(self.lock_shards));
    let metrics = Arc::new(Metrics::new());

    // A zero default means "never expire".
    let time_to_live = self.time_to_live.filter(|d| !d.is_zero());

    let tick = match self.tick_interval {
      Some(duration) if duration.is_zero() => None,
      Some(duration) => Some(duration),
      None if time_to_live.is_some() => Some(DEFAULT_TICK_INTERVAL),
      None => None,
    };

    let (commands, janitor) = match tick {
      Some(tick) => {
        let (tx, rx) = mpsc::unbounded();
        let context = JanitorContext {
          store: Arc::clone(&store),
          locks: Arc::clone(&locks),
          listener: self.listener.clone(),
          metrics: Arc::clone(&metrics),
          acquire_timeout: self.acquire_timeout,
        };
        (Some(tx), Some(Janitor::spawn(context, tick, rx)))
      }
      None => (None, None),
    };

    Ok(Cache {
      shared: Arc::new(CacheShared {
        store,
        locks,
        metrics,
        listener: self.listener,
        commands,
        janitor,
        time_to_live,
        touch_on_read: self.touch_on_read,
        acquire_timeout: self.acquire_timeout,
      }),
    })
  }

  /// Validates the builder configuration.
  fn validate(&self) -> Result<(), BuildError> {
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    if self.lock_shards == 0 {
      return Err(BuildError::ZeroLockShards);
    }
    Ok(())
  }
}
