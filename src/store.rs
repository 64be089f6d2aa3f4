use core::fmt;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// A helper function to hash a key using a `BuildHasher`.
#[inline]
pub(crate) fn hash_key<K: Hash + ?Sized, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

type Shard<K, V, H> = RwLock<HashMap<K, Arc<V>, H>>;

/// The backing table: a map partitioned into independently locked shards.
///
/// Each listed operation is atomic with respect to itself; writers to keys
/// in distinct shards never block each other. The table holds values only,
/// no lifetime metadata.
pub(crate) struct ShardedStore<K, V, H> {
  shards: Box<[CachePadded<Shard<K, V, H>>]>,
  hasher: H,
}

impl<K, V, H> fmt::Debug for ShardedStore<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShardedStore")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K, V, H> ShardedStore<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher + Clone,
{
  /// Creates a new `ShardedStore` with the specified number of shards and
  /// hasher. The shard count must be a power of two.
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    debug_assert!(num_shards.is_power_of_two());

    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      let map = HashMap::with_hasher(hasher.clone());
      shards.push(CachePadded::new(RwLock::new(map)));
    }

    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  fn shard(&self, key: &K) -> &Shard<K, V, H> {
    let hash = hash_key(&self.hasher, key);
    let index = hash as usize & (self.shards.len() - 1);
    &self.shards[index]
  }

  pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
    self.shard(key).read().get(key).cloned()
  }

  pub(crate) fn contains_key(&self, key: &K) -> bool {
    self.shard(key).read().contains_key(key)
  }

  /// Inserts, overwriting any previous value. Returns the old value.
  pub(crate) fn insert(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
    self.shard(&key).write().insert(key, value)
  }

  /// Inserts only when the key is absent. Returns whether it inserted.
  pub(crate) fn insert_if_absent(&self, key: K, value: Arc<V>) -> bool {
    let mut guard = self.shard(&key).write();
    if guard.contains_key(&key) {
      return false;
    }
    guard.insert(key, value);
    true
  }

  pub(crate) fn remove(&self, key: &K) -> Option<Arc<V>> {
    self.shard(key).write().remove(key)
  }

  pub(crate) fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.read().len()).sum()
  }

  /// Collects every key. Diagnostics only; the snapshot is not atomic
  /// across shards.
  pub(crate) fn keys(&self) -> Vec<K>
  where
    K: Clone,
  {
    let mut keys = Vec::new();
    for shard in self.shards.iter() {
      keys.extend(shard.read().keys().cloned());
    }
    keys
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> ShardedStore<String, i32, ahash::RandomState> {
    ShardedStore::new(4, ahash::RandomState::new())
  }

  #[test]
  fn insert_overwrites_and_returns_old() {
    let store = store();
    assert!(store.insert("a".into(), Arc::new(1)).is_none());
    let old = store.insert("a".into(), Arc::new(2));
    assert_eq!(old.as_deref(), Some(&1));
    assert_eq!(store.get(&"a".into()).as_deref(), Some(&2));
  }

  #[test]
  fn insert_if_absent_respects_existing() {
    let store = store();
    assert!(store.insert_if_absent("a".into(), Arc::new(1)));
    assert!(!store.insert_if_absent("a".into(), Arc::new(2)));
    assert_eq!(store.get(&"a".into()).as_deref(), Some(&1));
  }

  #[test]
  fn remove_and_len() {
    let store = store();
    store.insert("a".into(), Arc::new(1));
    store.insert("b".into(), Arc::new(2));
    assert_eq!(store.len(), 2);
    assert_eq!(store.remove(&"a".into()).as_deref(), Some(&1));
    assert!(store.remove(&"a".into()).is_none());
    assert_eq!(store.len(), 1);

    let keys = store.keys();
    assert_eq!(keys, vec!["b".to_string()]);
  }
}
