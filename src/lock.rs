use crate::error::CacheError;
use crate::store::hash_key;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// The current holder of one row lock.
struct Holder {
  owner: ThreadId,
  /// Nested acquisitions by the owner. The lock is free again only when
  /// this drops to zero.
  reentry: usize,
}

/// One queued acquisition. A waiter whose deadline has passed is never
/// promoted to holder.
struct Waiter {
  owner: ThreadId,
  deadline: Instant,
}

/// Per-shard lock bookkeeping. Rows exist only while held or awaited, so
/// both maps collapse to empty under uncontended steady state.
struct LockTable<K> {
  holders: HashMap<K, Holder>,
  waiters: HashMap<K, VecDeque<Waiter>>,
}

struct LockShard<K> {
  table: Mutex<LockTable<K>>,
  /// Signalled whenever a waiter is promoted to holder.
  promoted: Condvar,
}

impl<K> LockShard<K> {
  fn new() -> Self {
    Self {
      table: Mutex::new(LockTable {
        holders: HashMap::new(),
        waiters: HashMap::new(),
      }),
      promoted: Condvar::new(),
    }
  }
}

/// A pool of row locks, partitioned into independently mutexed shards.
///
/// Any key can be locked; callers serialize on it while every other key
/// proceeds in parallel. The shard mutex serializes all bookkeeping for its
/// partition of the key space; shards never communicate. Locks are
/// reentrant for the same thread, and waiters at a given key are promoted
/// in FIFO order.
pub(crate) struct LockPool<K> {
  shards: Box<[CachePadded<LockShard<K>>]>,
  hasher: ahash::RandomState,
}

impl<K> LockPool<K>
where
  K: Eq + Hash + Clone,
{
  /// Creates a pool with the specified number of shards. The shard count
  /// must be a power of two.
  pub(crate) fn new(num_shards: usize) -> Self {
    debug_assert!(num_shards.is_power_of_two());

    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      shards.push(CachePadded::new(LockShard::new()));
    }

    Self {
      shards: shards.into_boxed_slice(),
      hasher: ahash::RandomState::new(),
    }
  }

  #[inline]
  fn shard(&self, key: &K) -> &LockShard<K> {
    let hash = hash_key(&self.hasher, key);
    let index = hash as usize & (self.shards.len() - 1);
    &self.shards[index]
  }

  /// Locks `key`, blocking up to `timeout` when another thread holds it.
  ///
  /// Reacquisition by the holding thread succeeds immediately and nests;
  /// the row is released when every guard has been dropped. Fails with
  /// [`CacheError::LockTimeout`] when the deadline passes first, in which
  /// case the caller was removed from the wait queue and can never be
  /// granted the lock afterwards.
  pub(crate) fn acquire<'a>(
    &'a self,
    key: &K,
    timeout: Duration,
  ) -> Result<KeyGuard<'a, K>, CacheError> {
    let me = thread::current().id();
    let shard = self.shard(key);
    let mut table = shard.table.lock();

    match table.holders.entry(key.clone()) {
      Entry::Vacant(slot) => {
        slot.insert(Holder { owner: me, reentry: 1 });
        return Ok(KeyGuard { shard, key: key.clone(), owner: me });
      }
      Entry::Occupied(mut slot) => {
        let holder = slot.get_mut();
        if holder.owner == me {
          holder.reentry += 1;
          return Ok(KeyGuard { shard, key: key.clone(), owner: me });
        }
      }
    }

    let deadline = Instant::now() + timeout;
    table
      .waiters
      .entry(key.clone())
      .or_default()
      .push_back(Waiter { owner: me, deadline });

    loop {
      if table.holders.get(key).map_or(false, |h| h.owner == me) {
        return Ok(KeyGuard { shard, key: key.clone(), owner: me });
      }

      if shard.promoted.wait_until(&mut table, deadline).timed_out() {
        // The promotion may have landed in the same instant the wait
        // expired; ownership wins over the timeout in that race.
        if table.holders.get(key).map_or(false, |h| h.owner == me) {
          return Ok(KeyGuard { shard, key: key.clone(), owner: me });
        }
        if let Some(queue) = table.waiters.get_mut(key) {
          queue.retain(|w| w.owner != me);
          if queue.is_empty() {
            table.waiters.remove(key);
          }
        }
        return Err(CacheError::LockTimeout);
      }
    }
  }

  /// Locks `key` without ever blocking. Fails with [`CacheError::Locked`]
  /// when another thread holds it; reacquisition by the holder nests as in
  /// [`acquire`](Self::acquire).
  pub(crate) fn try_acquire<'a>(&'a self, key: &K) -> Result<KeyGuard<'a, K>, CacheError> {
    let me = thread::current().id();
    let shard = self.shard(key);
    let mut table = shard.table.lock();

    match table.holders.entry(key.clone()) {
      Entry::Vacant(slot) => {
        slot.insert(Holder { owner: me, reentry: 1 });
        Ok(KeyGuard { shard, key: key.clone(), owner: me })
      }
      Entry::Occupied(mut slot) => {
        let holder = slot.get_mut();
        if holder.owner == me {
          holder.reentry += 1;
          Ok(KeyGuard { shard, key: key.clone(), owner: me })
        } else {
          Err(CacheError::Locked)
        }
      }
    }
  }

  /// Runs `f` with `key` locked, releasing on every exit path. Nested
  /// calls on the same key by the same thread do not deadlock.
  pub(crate) fn with<R>(
    &self,
    key: &K,
    timeout: Duration,
    f: impl FnOnce() -> R,
  ) -> Result<R, CacheError> {
    let _guard = self.acquire(key, timeout)?;
    Ok(f())
  }

  #[cfg(test)]
  fn is_idle(&self) -> bool {
    self.shards.iter().all(|shard| {
      let table = shard.table.lock();
      table.holders.is_empty() && table.waiters.is_empty()
    })
  }
}

/// Exclusive ownership of one row lock. Dropping the guard releases one
/// nesting level; at zero the next live waiter is promoted and woken. Drop
/// runs during panic unwinding too, so a held row can never leak.
pub(crate) struct KeyGuard<'a, K>
where
  K: Eq + Hash + Clone,
{
  shard: &'a LockShard<K>,
  key: K,
  owner: ThreadId,
}

impl<K> Drop for KeyGuard<'_, K>
where
  K: Eq + Hash + Clone,
{
  fn drop(&mut self) {
    let mut table = self.shard.table.lock();

    let Some(holder) = table.holders.get_mut(&self.key) else {
      return;
    };
    debug_assert_eq!(holder.owner, self.owner);
    holder.reentry -= 1;
    if holder.reentry > 0 {
      return;
    }
    table.holders.remove(&self.key);

    // Promote the next waiter still inside its deadline, FIFO.
    let now = Instant::now();
    let mut winner = None;
    if let Some(queue) = table.waiters.get_mut(&self.key) {
      while let Some(waiter) = queue.pop_front() {
        if waiter.deadline > now {
          winner = Some(waiter);
          break;
        }
      }
      if queue.is_empty() {
        table.waiters.remove(&self.key);
      }
    }

    if let Some(waiter) = winner {
      table.holders.insert(
        self.key.clone(),
        Holder { owner: waiter.owner, reentry: 1 },
      );
      drop(table);
      self.shard.promoted.notify_all();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Barrier};

  const LONG: Duration = Duration::from_secs(5);

  fn pool() -> Arc<LockPool<String>> {
    Arc::new(LockPool::new(4))
  }

  #[test]
  fn uncontended_acquire_and_release() {
    let pool = pool();
    let key = "k".to_string();

    let guard = pool.acquire(&key, LONG).unwrap();
    drop(guard);
    assert!(pool.is_idle());
  }

  #[test]
  fn reentrant_acquire_nests() {
    let pool = pool();
    let key = "k".to_string();

    let outer = pool.acquire(&key, LONG).unwrap();
    let inner = pool.acquire(&key, LONG).unwrap();
    let tried = pool.try_acquire(&key).unwrap();
    drop(tried);
    drop(inner);

    // Still held by this thread until the outer guard goes.
    let pool_clone = pool.clone();
    let key_clone = key.clone();
    let held = std::thread::spawn(move || pool_clone.try_acquire(&key_clone).is_err())
      .join()
      .unwrap();
    assert!(held);

    drop(outer);
    assert!(pool.is_idle());
  }

  #[test]
  fn acquire_times_out_while_held_elsewhere() {
    let pool = pool();
    let key = "k".to_string();

    let barrier = Arc::new(Barrier::new(2));
    let holder = {
      let pool = pool.clone();
      let key = key.clone();
      let barrier = barrier.clone();
      std::thread::spawn(move || {
        let _guard = pool.acquire(&key, LONG).unwrap();
        barrier.wait();
        std::thread::sleep(Duration::from_millis(200));
      })
    };

    barrier.wait();
    let started = Instant::now();
    let result = pool.acquire(&key, Duration::from_millis(50));
    assert!(matches!(result, Err(CacheError::LockTimeout)));
    assert!(started.elapsed() < Duration::from_millis(180));

    holder.join().unwrap();
    assert!(pool.is_idle());
  }

  #[test]
  fn waiters_are_promoted_in_fifo_order() {
    let pool = pool();
    let key = "k".to_string();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = pool.acquire(&key, LONG).unwrap();

    let mut handles = Vec::new();
    for tag in 0..3 {
      let pool = pool.clone();
      let key = key.clone();
      let order = order.clone();
      handles.push(std::thread::spawn(move || {
        let _guard = pool.acquire(&key, LONG).unwrap();
        order.lock().push(tag);
      }));
      // Give each waiter time to enqueue before the next one arrives.
      std::thread::sleep(Duration::from_millis(50));
    }

    drop(first);
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert!(pool.is_idle());
  }

  #[test]
  fn lock_is_released_when_the_holder_panics() {
    let pool = pool();
    let key = "k".to_string();

    let result = {
      let pool = pool.clone();
      let key = key.clone();
      std::thread::spawn(move || {
        let _guard = pool.acquire(&key, LONG).unwrap();
        panic!("holder died");
      })
      .join()
    };
    assert!(result.is_err());

    assert!(pool.try_acquire(&key).is_ok());
    assert!(pool.is_idle());
  }

  #[test]
  fn with_serializes_a_read_modify_write() {
    let pool = pool();
    let key = "n".to_string();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let pool = pool.clone();
      let key = key.clone();
      let counter = counter.clone();
      handles.push(std::thread::spawn(move || {
        for _ in 0..100 {
          pool
            .with(&key, LONG, || {
              let seen = counter.load(Ordering::Relaxed);
              counter.store(seen + 1, Ordering::Relaxed);
            })
            .unwrap();
        }
      }));
    }
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 800);
    assert!(pool.is_idle());
  }
}
