use crate::listener::{CacheEvent, CacheListener};
use crate::lock::LockPool;
use crate::metrics::Metrics;
use crate::store::ShardedStore;
use crate::task::wheel::ExpiryWheel;

use std::hash::{BuildHasher, Hash};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fibre::mpsc;

/// A lifetime request from the operation layer. Senders enqueue and
/// return; the janitor folds the queue into its wheel once per tick, so
/// the last request for a key wins.
pub(crate) enum TtlCommand<K> {
  /// Schedule (or reschedule) the key to expire this long from now.
  Schedule(K, Duration),
  /// Drop the key's deadline; it no longer expires.
  Cancel(K),
}

/// A context object holding the thread-safe parts of the cache that the
/// janitor needs to delete expired entries.
pub(crate) struct JanitorContext<K: Send, V: Send + Sync, H> {
  pub(crate) store: Arc<ShardedStore<K, V, H>>,
  pub(crate) locks: Arc<LockPool<K>>,
  pub(crate) listener: Option<Arc<dyn CacheListener<K, V>>>,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) acquire_timeout: Duration,
}

/// The background thread that owns all expiry state. One step per tick:
/// drain the command queue, expire the keys due at this tick, advance.
/// Steps are never coalesced; a slow step delays the following ticks
/// rather than skipping slots.
pub(crate) struct Janitor {
  _handle: JoinHandle<()>,
  stop_flag: Arc<AtomicBool>,
}

impl Janitor {
  /// Spawns the janitor thread.
  pub(crate) fn spawn<K, V, H>(
    context: JanitorContext<K, V, H>,
    tick: Duration,
    commands: mpsc::UnboundedSyncReceiver<TtlCommand<K>>,
  ) -> Self
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    H: BuildHasher + Clone + Send + Sync + 'static,
  {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_clone = stop_flag.clone();

    let handle = thread::spawn(move || {
      let mut wheel = ExpiryWheel::new(tick);
      while !stop_clone.load(Ordering::Relaxed) {
        let step_start = Instant::now();

        Self::step(&context, &mut wheel, &commands, tick);

        // Sleep for the remaining duration of the tick.
        if let Some(remaining) = tick.checked_sub(step_start.elapsed()) {
          thread::sleep(remaining);
        }
      }
    });

    Self {
      _handle: handle,
      stop_flag,
    }
  }

  fn step<K, V, H>(
    context: &JanitorContext<K, V, H>,
    wheel: &mut ExpiryWheel<K>,
    commands: &mpsc::UnboundedSyncReceiver<TtlCommand<K>>,
    tick: Duration,
  ) where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
    H: BuildHasher + Clone,
  {
    // Fold every queued lifetime command into the wheel before deciding
    // what is due at this tick.
    while let Ok(command) = commands.try_recv() {
      match command {
        TtlCommand::Schedule(key, ttl) => wheel.schedule(key, ttl),
        TtlCommand::Cancel(key) => wheel.cancel(&key),
      }
    }

    for key in wheel.advance() {
      if !Self::expire(context, &key) {
        // The row was busy past the timeout. Keep the deadline alive and
        // retry at the next tick.
        wheel.schedule(key, tick);
      }
    }
  }

  /// Deletes one expired entry through the standard delete path: row lock,
  /// delete event, then the store mutation. Returns `false` when the row
  /// lock could not be acquired in time.
  fn expire<K, V, H>(context: &JanitorContext<K, V, H>, key: &K) -> bool
  where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
    H: BuildHasher + Clone,
  {
    let _row = match context.locks.acquire(key, context.acquire_timeout) {
      Ok(guard) => guard,
      Err(_) => {
        context.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        log::warn!("row lock busy while expiring an entry; retrying next tick");
        return false;
      }
    };

    // The key may have been deleted or replaced since its slot was filled;
    // an absent entry simply means there is nothing left to expire.
    let Some(value) = context.store.get(key) else {
      return true;
    };

    if let Some(listener) = &context.listener {
      let event = CacheEvent::Delete {
        key: key.clone(),
        value: Some(value),
      };
      // There is no caller to propagate to here, and a hostile listener
      // must not take the tick loop down with it.
      match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => log::error!("cache listener failed during expiry: {}", error),
        Err(_) => log::error!("cache listener panicked during expiry"),
      }
    }

    context.store.remove(key);
    context.metrics.expired.fetch_add(1, Ordering::Relaxed);
    true
  }

  /// Signals the janitor thread to stop. It exits at its next wakeup.
  pub(crate) fn stop(self) {
    self.stop_flag.store(true, Ordering::Relaxed);
  }
}
