use std::time::Duration;

/// A per-item lifetime override supplied alongside a written value.
///
/// The plain write operations (`put`, `insert_new`, ...) use
/// [`Ttl::Default`]; the `*_with_ttl` variants accept any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
  /// Use the cache-wide default lifetime.
  Default,
  /// The item never expires, regardless of the cache-wide default.
  Never,
  /// The item expires this long after the write. A zero duration is
  /// equivalent to [`Ttl::Never`].
  After(Duration),
}

/// The outcome of an update closure.
///
/// Callers may inspect the current value under the row lock and decide to
/// leave it untouched; [`Mutation::Keep`] writes nothing and fires no
/// listener event. The variant is a tag, never an in-band value, so it can
/// not collide with any stored `V`.
#[derive(Debug)]
pub enum Mutation<V> {
  /// Store a new value, refreshing the default lifetime.
  Set(V),
  /// Store a new value with an explicit lifetime override.
  SetWithTtl(V, Ttl),
  /// Leave the stored value untouched.
  Keep,
}
