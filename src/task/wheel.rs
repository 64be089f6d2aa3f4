use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

/// The bucketed expiry wheel owned by the janitor thread.
///
/// `deadlines` is authoritative: a key expires at tick `t` only when
/// `deadlines[key] == t`. Rescheduling and cancelling touch `deadlines`
/// alone, so `buckets` may keep stale references; those are filtered when
/// their slot comes due. Scheduling and refreshing are therefore O(1), and
/// a tick's work is proportional to the number of keys actually due, never
/// the cache size.
pub(crate) struct ExpiryWheel<K> {
  tick: Duration,
  now_tick: u64,
  buckets: HashMap<u64, HashSet<K>>,
  deadlines: HashMap<K, u64>,
}

impl<K> ExpiryWheel<K>
where
  K: Eq + Hash + Clone,
{
  pub(crate) fn new(tick: Duration) -> Self {
    debug_assert!(!tick.is_zero());
    Self {
      tick,
      now_tick: 0,
      buckets: HashMap::new(),
      deadlines: HashMap::new(),
    }
  }

  /// Schedules (or reschedules) `key` to expire `ttl` from now, rounded up
  /// to whole ticks. The latest schedule for a key wins.
  pub(crate) fn schedule(&mut self, key: K, ttl: Duration) {
    let ticks = ttl
      .as_millis()
      .div_ceil(self.tick.as_millis())
      .max(1) as u64;
    let target = self.now_tick + ticks;

    self.deadlines.insert(key.clone(), target);
    self.buckets.entry(target).or_default().insert(key);
  }

  /// Drops the deadline for `key`; it will never expire unless rescheduled.
  pub(crate) fn cancel(&mut self, key: &K) {
    self.deadlines.remove(key);
  }

  /// Pops the current slot and advances the wheel one tick, returning the
  /// keys genuinely due now.
  pub(crate) fn advance(&mut self) -> Vec<K> {
    let slot = self.buckets.remove(&self.now_tick).unwrap_or_default();

    let mut due = Vec::new();
    for key in slot {
      if self.deadlines.get(&key) == Some(&self.now_tick) {
        self.deadlines.remove(&key);
        due.push(key);
      }
    }

    self.now_tick += 1;
    due
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn wheel() -> ExpiryWheel<&'static str> {
    ExpiryWheel::new(Duration::from_millis(100))
  }

  /// Advances until `key` comes due or `limit` ticks pass; returns the
  /// tick index it fired at.
  fn fire_tick(wheel: &mut ExpiryWheel<&'static str>, key: &'static str, limit: u64) -> Option<u64> {
    for _ in 0..limit {
      let tick = wheel.now_tick;
      if wheel.advance().contains(&key) {
        return Some(tick);
      }
    }
    None
  }

  #[test]
  fn schedule_rounds_up_to_whole_ticks() {
    let mut wheel = wheel();
    wheel.schedule("a", Duration::from_millis(250));
    assert_eq!(fire_tick(&mut wheel, "a", 10), Some(3));
  }

  #[test]
  fn reschedule_defers_and_stale_slot_is_filtered() {
    let mut wheel = wheel();
    wheel.schedule("a", Duration::from_millis(100));
    wheel.schedule("a", Duration::from_millis(300));

    // The slot from the first schedule still names the key, but the
    // deadline moved, so tick 1 yields nothing.
    assert!(wheel.advance().is_empty());
    assert_eq!(fire_tick(&mut wheel, "a", 10), Some(3));
  }

  #[test]
  fn cancel_prevents_expiry() {
    let mut wheel = wheel();
    wheel.schedule("a", Duration::from_millis(100));
    wheel.cancel(&"a");
    assert_eq!(fire_tick(&mut wheel, "a", 10), None);
  }

  #[test]
  fn keys_fire_once() {
    let mut wheel = wheel();
    wheel.schedule("a", Duration::from_millis(100));
    assert_eq!(fire_tick(&mut wheel, "a", 10), Some(1));
    assert_eq!(fire_tick(&mut wheel, "a", 10), None);
  }

  #[test]
  fn zero_ttl_still_takes_one_tick() {
    let mut wheel = wheel();
    wheel.schedule("a", Duration::ZERO);
    assert_eq!(fire_tick(&mut wheel, "a", 10), Some(1));
  }

  #[test]
  fn distinct_keys_share_a_slot() {
    let mut wheel = wheel();
    wheel.schedule("a", Duration::from_millis(100));
    wheel.schedule("b", Duration::from_millis(100));
    let mut due = wheel.advance();
    due.sort_unstable();
    assert_eq!(due, vec!["a", "b"]);
  }
}
