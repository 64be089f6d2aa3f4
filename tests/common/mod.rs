use rowcache::{CacheEvent, ListenerError};

use std::sync::{Arc, Mutex};

/// A listener observation, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
  Update(String, i32),
  Delete(String, Option<i32>),
}

/// Builds a closure listener that records every event into `log`.
pub fn recording_listener(
  log: &Arc<Mutex<Vec<Seen>>>,
) -> impl Fn(CacheEvent<String, i32>) -> Result<(), ListenerError> + Send + Sync + 'static {
  let log = Arc::clone(log);
  move |event| {
    let seen = match event {
      CacheEvent::Update { key, value } => Seen::Update(key, *value),
      CacheEvent::Delete { key, value } => Seen::Delete(key, value.map(|v| *v)),
    };
    log.lock().unwrap().push(seen);
    Ok(())
  }
}
