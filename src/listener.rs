use crate::error::ListenerError;

use std::sync::Arc;

/// A mutation observed by a [`CacheListener`].
#[derive(Debug, Clone)]
pub enum CacheEvent<K, V> {
  /// A value was written. Fired after the store mutation, so the cache
  /// already holds `value` when the listener runs.
  Update {
    key: K,
    value: Arc<V>,
  },
  /// A key was deleted (or expired). Fired before the store mutation;
  /// `value` is the entry being removed, or `None` when the key was
  /// absent.
  Delete {
    key: K,
    value: Option<Arc<V>>,
  },
}

/// A listener invoked synchronously after inserts and updates and before
/// deletes, on the mutating caller, while the row lock is held.
///
/// Returning an error surfaces to the caller as
/// [`CacheError::CallbackFailed`](crate::CacheError::CallbackFailed); the
/// store is left in the state described on [`CacheEvent`]. During TTL
/// expiry there is no caller to report to, so failures are logged and the
/// removal proceeds.
pub trait CacheListener<K, V>: Send + Sync {
  fn on_event(&self, event: CacheEvent<K, V>) -> Result<(), ListenerError>;
}

/// Plain closures can serve as listeners.
impl<K, V, F> CacheListener<K, V> for F
where
  F: Fn(CacheEvent<K, V>) -> Result<(), ListenerError> + Send + Sync,
{
  fn on_event(&self, event: CacheEvent<K, V>) -> Result<(), ListenerError> {
    self(event)
  }
}
