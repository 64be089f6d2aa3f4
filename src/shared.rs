use crate::entry::Ttl;
use crate::error::CacheError;
use crate::listener::{CacheEvent, CacheListener};
use crate::lock::LockPool;
use crate::metrics::Metrics;
use crate::store::ShardedStore;
use crate::task::janitor::{Janitor, TtlCommand};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fibre::mpsc;

/// The internal, thread-safe core of the cache.
pub(crate) struct CacheShared<K: Send, V: Send + Sync, H> {
  pub(crate) store: Arc<ShardedStore<K, V, H>>,
  pub(crate) locks: Arc<LockPool<K>>,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) listener: Option<Arc<dyn CacheListener<K, V>>>,
  /// Present only while a janitor is running; absent means expiry is
  /// disabled and lifetime requests are silently dropped.
  pub(crate) commands: Option<mpsc::UnboundedSyncSender<TtlCommand<K>>>,
  pub(crate) janitor: Option<Janitor>,
  pub(crate) time_to_live: Option<Duration>,
  pub(crate) touch_on_read: bool,
  pub(crate) acquire_timeout: Duration,
}

impl<K: Send, V: Send + Sync, H> fmt::Debug for CacheShared<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheShared")
      .field("store", &self.store)
      .field("time_to_live", &self.time_to_live)
      .field("touch_on_read", &self.touch_on_read)
      .field("acquire_timeout", &self.acquire_timeout)
      .field("expiry_enabled", &self.janitor.is_some())
      .finish_non_exhaustive()
  }
}

impl<K: Send, V: Send + Sync, H> Drop for CacheShared<K, V, H> {
  fn drop(&mut self) {
    if let Some(janitor) = self.janitor.take() {
      janitor.stop();
    }
  }
}

impl<K, V, H> CacheShared<K, V, H>
where
  K: Send + Clone,
  V: Send + Sync,
{
  /// Resolves a per-item lifetime against the cache default and forwards
  /// it to the janitor. A no-op when expiry is disabled.
  pub(crate) fn send_ttl(&self, key: &K, ttl: Ttl) {
    let Some(commands) = &self.commands else {
      return;
    };

    let command = match ttl {
      Ttl::Default => match self.time_to_live {
        Some(duration) => TtlCommand::Schedule(key.clone(), duration),
        None => TtlCommand::Cancel(key.clone()),
      },
      Ttl::Never => TtlCommand::Cancel(key.clone()),
      Ttl::After(duration) if duration.is_zero() => TtlCommand::Cancel(key.clone()),
      Ttl::After(duration) => TtlCommand::Schedule(key.clone(), duration),
    };
    let _ = commands.clone().send(command);
  }

  /// Refreshes the key's deadline to the default lifetime. A no-op when no
  /// default is configured or expiry is disabled.
  pub(crate) fn touch_key(&self, key: &K) {
    let (Some(commands), Some(ttl)) = (&self.commands, self.time_to_live) else {
      return;
    };
    let _ = commands.clone().send(TtlCommand::Schedule(key.clone(), ttl));
  }

  /// Invokes the listener, mapping its failure to the caller-facing error.
  pub(crate) fn notify(&self, event: CacheEvent<K, V>) -> Result<(), CacheError> {
    match &self.listener {
      Some(listener) => listener.on_event(event).map_err(CacheError::CallbackFailed),
      None => Ok(()),
    }
  }
}
