use crate::entry::{Mutation, Ttl};
use crate::error::CacheError;
use crate::listener::CacheEvent;
use crate::lock::KeyGuard;
use crate::metrics::MetricsSnapshot;
use crate::shared::CacheShared;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A handle to one cache instance.
///
/// Handles are cheap to clone and share one backing store, row-lock pool
/// and janitor. Every operation runs on the calling thread; mutators
/// serialize per key on the row lock, take one atomic step on the store,
/// forward the entry's lifetime to the janitor and then invoke the
/// listener, all before the lock is released. Reads never lock and may
/// observe any committed prefix of a key's mutation history.
pub struct Cache<K: Send, V: Send + Sync, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<K, V, H>>,
}

impl<K: Send, V: Send + Sync, H> fmt::Debug for Cache<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache").field("shared", &self.shared).finish()
  }
}

impl<K: Send, V: Send + Sync, H> Clone for Cache<K, V, H> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<K, V, H> Cache<K, V, H>
where
  K: Eq + Hash + Clone + Send,
  V: Send + Sync,
  H: BuildHasher + Clone,
{
  /// Retrieves the value stored for `key`.
  ///
  /// Takes no lock: a read concurrent with a mutation returns either the
  /// old or the new value. With `touch_on_read` configured, a hit
  /// refreshes the entry's deadline to the default lifetime.
  pub fn get(&self, key: &K) -> Option<Arc<V>> {
    match self.shared.store.get(key) {
      Some(value) => {
        self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
        if self.shared.touch_on_read {
          self.shared.touch_key(key);
        }
        Some(value)
      }
      None => {
        self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Stores `value` under `key`, overwriting any previous value and
  /// refreshing the default lifetime.
  pub fn put(&self, key: K, value: V) -> Result<(), CacheError> {
    self.put_with_ttl(key, value, Ttl::Default)
  }

  /// As [`put`](Self::put), with a per-item lifetime override.
  pub fn put_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<(), CacheError> {
    let _row = self.lock_row(&key)?;
    self.put_value(key, Arc::new(value), ttl)
  }

  /// Stores `value` only when `key` is absent; fails with
  /// [`CacheError::AlreadyExists`] otherwise.
  pub fn insert_new(&self, key: K, value: V) -> Result<(), CacheError> {
    self.insert_new_with_ttl(key, value, Ttl::Default)
  }

  /// As [`insert_new`](Self::insert_new), with a per-item lifetime
  /// override.
  pub fn insert_new_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<(), CacheError> {
    let _row = self.lock_row(&key)?;
    self.insert_new_value(key, Arc::new(value), ttl)
  }

  /// Atomically computes a new value for `key` from the current one.
  ///
  /// `f` runs under the row lock and receives exactly the value the write
  /// will replace; no concurrent locked mutation can interleave. Returning
  /// [`Mutation::Keep`] stores nothing and fires no listener event.
  pub fn update<F>(&self, key: &K, f: F) -> Result<(), CacheError>
  where
    F: FnOnce(Option<&V>) -> Mutation<V>,
  {
    let _row = self.lock_row(key)?;
    let current = self.shared.store.get(key);
    let mutation = f(current.as_deref());
    drop(current);
    self.apply_mutation(key, mutation)
  }

  /// As [`update`](Self::update), but fails with
  /// [`CacheError::NotExisting`] instead of calling `f` when the key is
  /// absent.
  pub fn update_existing<F>(&self, key: &K, f: F) -> Result<(), CacheError>
  where
    F: FnOnce(&V) -> Mutation<V>,
  {
    let _row = self.lock_row(key)?;
    let Some(current) = self.shared.store.get(key) else {
      return Err(CacheError::NotExisting);
    };
    let mutation = f(&current);
    drop(current);
    self.apply_mutation(key, mutation)
  }

  /// Returns the value stored for `key`, computing and storing it with `f`
  /// on a miss.
  ///
  /// A hit takes no lock. On a miss the row lock is taken and the store
  /// re-checked, so concurrent callers compute `f` at most once between
  /// them; the loser returns the winner's value.
  pub fn get_or_store<F>(&self, key: &K, f: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> V,
  {
    self.get_or_store_with_ttl(key, Ttl::Default, f)
  }

  /// As [`get_or_store`](Self::get_or_store), with a per-item lifetime
  /// override applied when the miss path stores.
  pub fn get_or_store_with_ttl<F>(&self, key: &K, ttl: Ttl, f: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> V,
  {
    if let Some(value) = self.shared.store.get(key) {
      self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
      return Ok(value);
    }

    let _row = self.lock_row(key)?;
    self.get_or_store_value(key, ttl, f)
  }

  /// Removes `key`.
  ///
  /// The delete event fires before the store mutation, so the listener
  /// still observes the stored value; when it fails, the entry remains.
  pub fn delete(&self, key: &K) -> Result<(), CacheError> {
    let _row = self.lock_row(key)?;
    self.delete_value(key)
  }

  /// Refreshes the key's deadline to the default lifetime. A no-op when no
  /// default is configured. Touching an absent key is permitted; the
  /// deadline is discarded when it comes due.
  pub fn touch(&self, key: &K) {
    self.shared.touch_key(key);
  }

  /// Runs `f` on the value stored for `key`, or fails with
  /// [`CacheError::NotExisting`]. Takes no lock and fires no events.
  pub fn with_existing<R, F>(&self, key: &K, f: F) -> Result<R, CacheError>
  where
    F: FnOnce(&V) -> R,
  {
    match self.shared.store.get(key) {
      Some(value) => {
        self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Ok(f(&value))
      }
      None => {
        self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
        Err(CacheError::NotExisting)
      }
    }
  }

  /// Runs `f` while holding the row lock for `key`, serializing it against
  /// every locked operation on the same key. The lock is reentrant: nested
  /// `isolated` calls and locked operations on the same key from within
  /// `f` do not deadlock. The lock is released on every exit path.
  pub fn isolated<R, F>(&self, key: &K, f: F) -> Result<R, CacheError>
  where
    F: FnOnce() -> R,
  {
    let result = self
      .shared
      .locks
      .with(key, self.shared.acquire_timeout, f);
    if matches!(result, Err(CacheError::LockTimeout)) {
      self
        .shared
        .metrics
        .lock_timeouts
        .fetch_add(1, Ordering::Relaxed);
    }
    result
  }

  /// As [`isolated`](Self::isolated), but fails with
  /// [`CacheError::Locked`] immediately when another caller holds the row
  /// lock.
  pub fn try_isolated<R, F>(&self, key: &K, f: F) -> Result<R, CacheError>
  where
    F: FnOnce() -> R,
  {
    let _row = self.shared.locks.try_acquire(key)?;
    Ok(f())
  }

  // --- Dirty variants ---
  //
  // Each skips the row lock but keeps everything else: one atomic store
  // step, the lifetime forwarding and the listener event. Only compound
  // read-modify-write loses its isolation.

  /// [`put`](Self::put) without the row lock.
  pub fn dirty_put(&self, key: K, value: V) -> Result<(), CacheError> {
    self.dirty_put_with_ttl(key, value, Ttl::Default)
  }

  /// [`put_with_ttl`](Self::put_with_ttl) without the row lock.
  pub fn dirty_put_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<(), CacheError> {
    self.put_value(key, Arc::new(value), ttl)
  }

  /// [`insert_new`](Self::insert_new) without the row lock.
  pub fn dirty_insert_new(&self, key: K, value: V) -> Result<(), CacheError> {
    self.dirty_insert_new_with_ttl(key, value, Ttl::Default)
  }

  /// [`insert_new_with_ttl`](Self::insert_new_with_ttl) without the row
  /// lock.
  pub fn dirty_insert_new_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<(), CacheError> {
    self.insert_new_value(key, Arc::new(value), ttl)
  }

  /// [`update`](Self::update) without the row lock: the lookup and the
  /// write are each atomic, but another writer may interleave between
  /// them.
  pub fn dirty_update<F>(&self, key: &K, f: F) -> Result<(), CacheError>
  where
    F: FnOnce(Option<&V>) -> Mutation<V>,
  {
    let current = self.shared.store.get(key);
    let mutation = f(current.as_deref());
    drop(current);
    self.apply_mutation(key, mutation)
  }

  /// [`update_existing`](Self::update_existing) without the row lock.
  pub fn dirty_update_existing<F>(&self, key: &K, f: F) -> Result<(), CacheError>
  where
    F: FnOnce(&V) -> Mutation<V>,
  {
    let Some(current) = self.shared.store.get(key) else {
      return Err(CacheError::NotExisting);
    };
    let mutation = f(&current);
    drop(current);
    self.apply_mutation(key, mutation)
  }

  /// [`get_or_store`](Self::get_or_store) without the row lock: concurrent
  /// missing callers may each run `f`, with one winner.
  pub fn dirty_get_or_store<F>(&self, key: &K, f: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> V,
  {
    self.dirty_get_or_store_with_ttl(key, Ttl::Default, f)
  }

  /// [`get_or_store_with_ttl`](Self::get_or_store_with_ttl) without the
  /// row lock.
  pub fn dirty_get_or_store_with_ttl<F>(&self, key: &K, ttl: Ttl, f: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> V,
  {
    if let Some(value) = self.shared.store.get(key) {
      self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
      return Ok(value);
    }
    self.get_or_store_value(key, ttl, f)
  }

  /// [`delete`](Self::delete) without the row lock.
  pub fn dirty_delete(&self, key: &K) -> Result<(), CacheError> {
    self.delete_value(key)
  }

  // --- Diagnostics ---

  /// The number of stored entries, summed across shards.
  pub fn len(&self) -> usize {
    self.shared.store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether `key` is currently stored. Does not count as a read for
  /// `touch_on_read`.
  pub fn contains_key(&self, key: &K) -> bool {
    self.shared.store.contains_key(key)
  }

  /// Every stored key. The snapshot is not atomic across shards.
  pub fn keys(&self) -> Vec<K> {
    self.shared.store.keys()
  }

  /// A point-in-time snapshot of the cache's metrics.
  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  // --- Shared operation bodies ---

  fn lock_row<'a>(&'a self, key: &K) -> Result<KeyGuard<'a, K>, CacheError> {
    self
      .shared
      .locks
      .acquire(key, self.shared.acquire_timeout)
      .map_err(|error| {
        self
          .shared
          .metrics
          .lock_timeouts
          .fetch_add(1, Ordering::Relaxed);
        error
      })
  }

  /// Store write, lifetime forwarding, then the update event, in that
  /// order. When the listener fails the write stands.
  fn put_value(&self, key: K, value: Arc<V>, ttl: Ttl) -> Result<(), CacheError> {
    self.shared.store.insert(key.clone(), Arc::clone(&value));
    self.shared.send_ttl(&key, ttl);
    self.shared.metrics.inserts.fetch_add(1, Ordering::Relaxed);
    self.shared.notify(CacheEvent::Update { key, value })
  }

  fn insert_new_value(&self, key: K, value: Arc<V>, ttl: Ttl) -> Result<(), CacheError> {
    if !self
      .shared
      .store
      .insert_if_absent(key.clone(), Arc::clone(&value))
    {
      return Err(CacheError::AlreadyExists);
    }
    self.shared.send_ttl(&key, ttl);
    self.shared.metrics.inserts.fetch_add(1, Ordering::Relaxed);
    self.shared.notify(CacheEvent::Update { key, value })
  }

  fn apply_mutation(&self, key: &K, mutation: Mutation<V>) -> Result<(), CacheError> {
    let (value, ttl) = match mutation {
      Mutation::Keep => return Ok(()),
      Mutation::Set(value) => (value, Ttl::Default),
      Mutation::SetWithTtl(value, ttl) => (value, ttl),
    };

    let value = Arc::new(value);
    self.shared.store.insert(key.clone(), Arc::clone(&value));
    self.shared.send_ttl(key, ttl);
    self.shared.metrics.updates.fetch_add(1, Ordering::Relaxed);
    self.shared.notify(CacheEvent::Update {
      key: key.clone(),
      value,
    })
  }

  fn get_or_store_value<F>(&self, key: &K, ttl: Ttl, f: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce() -> V,
  {
    // Another caller may have stored between the caller's miss and here.
    if let Some(value) = self.shared.store.get(key) {
      self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
      return Ok(value);
    }
    self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);

    let value = Arc::new(f());
    self.shared.store.insert(key.clone(), Arc::clone(&value));
    self.shared.send_ttl(key, ttl);
    self.shared.metrics.inserts.fetch_add(1, Ordering::Relaxed);
    self.shared.notify(CacheEvent::Update {
      key: key.clone(),
      value: Arc::clone(&value),
    })?;
    Ok(value)
  }

  fn delete_value(&self, key: &K) -> Result<(), CacheError> {
    let value = self.shared.store.get(key);
    let was_present = value.is_some();

    // The event goes out first so the listener can still observe the
    // value; on failure the entry must remain.
    self.shared.notify(CacheEvent::Delete {
      key: key.clone(),
      value,
    })?;

    self.shared.store.remove(key);
    self.shared.send_ttl(key, Ttl::Never);
    if was_present {
      self.shared.metrics.deletes.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
  }
}
