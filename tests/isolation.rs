mod common;

use common::recording_listener;
use rowcache::{Cache, CacheBuilder, CacheError, Mutation};

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn new_test_cache() -> Cache<String, i32> {
  CacheBuilder::new().build().unwrap()
}

#[test]
fn concurrent_updates_serialize_per_key() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let cache: Cache<String, i32> = CacheBuilder::new()
    .listener(recording_listener(&log))
    .build()
    .unwrap();

  let threads = 10;
  let updates_per_thread = 100;
  let barrier = Arc::new(Barrier::new(threads));

  let mut handles = Vec::new();
  for _ in 0..threads {
    let cache = cache.clone();
    let barrier = barrier.clone();
    handles.push(thread::spawn(move || {
      barrier.wait();
      for _ in 0..updates_per_thread {
        cache
          .update(&"n".to_string(), |old| Mutation::Set(old.copied().unwrap_or(0) + 1))
          .unwrap();
      }
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }

  // Every increment saw its predecessor's result: none were lost.
  let total = (threads * updates_per_thread) as i32;
  assert_eq!(cache.get(&"n".to_string()).as_deref(), Some(&total));
  assert_eq!(cache.metrics().updates, total as u64);

  // One update event per successful write.
  assert_eq!(log.lock().unwrap().len(), total as usize);
}

#[test]
fn distinct_keys_do_not_block_each_other() {
  let cache = new_test_cache();

  let barrier = Arc::new(Barrier::new(2));
  let holder = {
    let cache = cache.clone();
    let barrier = barrier.clone();
    thread::spawn(move || {
      cache
        .isolated(&"a".to_string(), || {
          barrier.wait();
          thread::sleep(Duration::from_millis(300));
        })
        .unwrap();
    })
  };

  barrier.wait();
  let started = Instant::now();
  cache.put("b".to_string(), 1).unwrap();
  assert!(
    started.elapsed() < Duration::from_millis(150),
    "a writer to another key must not wait for the held row"
  );

  holder.join().unwrap();
}

#[test]
fn isolated_is_reentrant() {
  let cache = new_test_cache();

  let result = cache
    .isolated(&"k".to_string(), || {
      cache.isolated(&"k".to_string(), || 42).unwrap()
    })
    .unwrap();
  assert_eq!(result, 42);
}

#[test]
fn operations_nest_inside_isolated() {
  let cache = new_test_cache();
  cache.put("k".to_string(), 1).unwrap();

  cache
    .isolated(&"k".to_string(), || {
      // The nested update reacquires the same row without deadlocking.
      cache
        .update(&"k".to_string(), |old| Mutation::Set(old.unwrap() + 1))
        .unwrap();
    })
    .unwrap();

  assert_eq!(cache.get(&"k".to_string()).as_deref(), Some(&2));
}

#[test]
fn try_isolated_reports_contention() {
  let cache = new_test_cache();

  let barrier = Arc::new(Barrier::new(2));
  let holder = {
    let cache = cache.clone();
    let barrier = barrier.clone();
    thread::spawn(move || {
      cache
        .isolated(&"L".to_string(), || {
          barrier.wait();
          thread::sleep(Duration::from_millis(300));
        })
        .unwrap();
    })
  };

  barrier.wait();
  let started = Instant::now();
  let busy = cache.try_isolated(&"L".to_string(), || ());
  assert!(matches!(busy, Err(CacheError::Locked)));
  assert!(started.elapsed() < Duration::from_millis(100));

  holder.join().unwrap();

  // Once the holder returns, the row is free again.
  assert!(cache.isolated(&"L".to_string(), || ()).is_ok());
}

#[test]
fn acquire_fails_loudly_after_the_timeout() {
  let cache: Cache<String, i32> = CacheBuilder::new()
    .acquire_timeout(Duration::from_millis(60))
    .build()
    .unwrap();

  let barrier = Arc::new(Barrier::new(2));
  let holder = {
    let cache = cache.clone();
    let barrier = barrier.clone();
    thread::spawn(move || {
      cache
        .isolated(&"k".to_string(), || {
          barrier.wait();
          thread::sleep(Duration::from_millis(400));
        })
        .unwrap();
    })
  };

  barrier.wait();
  let started = Instant::now();
  let blocked = cache.put("k".to_string(), 1);
  assert!(matches!(blocked, Err(CacheError::LockTimeout)));

  let waited = started.elapsed();
  assert!(waited >= Duration::from_millis(55));
  assert!(waited < Duration::from_millis(350));
  assert_eq!(cache.metrics().lock_timeouts, 1);

  holder.join().unwrap();

  // The row frees up once the holder returns.
  cache.put("k".to_string(), 1).unwrap();
  assert_eq!(cache.get(&"k".to_string()).as_deref(), Some(&1));
}

#[test]
fn isolated_guards_plain_critical_sections() {
  let cache = new_test_cache();
  let log: Arc<Mutex<Vec<(i32, &str)>>> = Arc::new(Mutex::new(Vec::new()));

  let mut handles = Vec::new();
  for tag in 0..4 {
    let cache = cache.clone();
    let log = log.clone();
    handles.push(thread::spawn(move || {
      cache
        .isolated(&"section".to_string(), || {
          log.lock().unwrap().push((tag, "enter"));
          thread::sleep(Duration::from_millis(20));
          log.lock().unwrap().push((tag, "exit"));
        })
        .unwrap();
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }

  // Sections never interleave: every enter is followed by its own exit.
  let log = log.lock().unwrap();
  assert_eq!(log.len(), 8);
  for pair in log.chunks(2) {
    assert_eq!(pair[0].1, "enter");
    assert_eq!(pair[1].1, "exit");
    assert_eq!(pair[0].0, pair[1].0);
  }
}
