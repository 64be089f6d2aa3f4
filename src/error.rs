use std::fmt;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache was configured with zero store shards, which is not allowed.
  ZeroShards,
  /// The cache was configured with zero lock shards, which is not allowed.
  ZeroLockShards,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::ZeroShards => write!(f, "store shard count cannot be zero"),
      BuildError::ZeroLockShards => write!(f, "lock shard count cannot be zero"),
    }
  }
}

impl std::error::Error for BuildError {}

/// The failure reported by a [`CacheListener`](crate::CacheListener).
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by cache operations.
#[derive(Debug)]
pub enum CacheError {
  /// `insert_new` found the key already present.
  AlreadyExists,
  /// `update_existing` or `with_existing` found the key absent.
  NotExisting,
  /// `try_isolated` found the row lock held by another caller.
  Locked,
  /// Row lock acquisition exceeded the configured timeout. The operation
  /// did not run.
  LockTimeout,
  /// The listener reported a failure. For updates and inserts the store
  /// mutation has already happened; for deletes it has not.
  CallbackFailed(ListenerError),
}

impl fmt::Display for CacheError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheError::AlreadyExists => write!(f, "key already exists"),
      CacheError::NotExisting => write!(f, "key does not exist"),
      CacheError::Locked => write!(f, "row lock is held by another caller"),
      CacheError::LockTimeout => write!(f, "timed out waiting for the row lock"),
      CacheError::CallbackFailed(source) => write!(f, "cache listener failed: {}", source),
    }
  }
}

impl std::error::Error for CacheError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      CacheError::CallbackFailed(source) => Some(source.as_ref()),
      _ => None,
    }
  }
}
