//! Per-key trailing-edge debouncer.
//!
//! Every trigger pushes the deadline of its key out by the debounce window; the
//! callback fires once per key after the window passes without new triggers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

type Callback = Arc<dyn Fn(String) + Send + Sync>;

pub struct Debouncer {
    window: Duration,
    deadlines: Arc<Mutex<HashMap<String, Instant>>>,
    on_fire: Callback,
}

impl Debouncer {
    pub fn new<F>(window: Duration, on_fire: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            window,
            deadlines: Arc::new(Mutex::new(HashMap::new())),
            on_fire: Arc::new(on_fire),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn trigger(&self, key: &str) {
        let deadline = Instant::now() + self.window;
        let first = self
            .deadlines
            .lock()
            .insert(key.to_string(), deadline)
            .is_none();
        trace!(key, first, "Debounce trigger");
        if !first {
            return;
        }

        let deadlines = Arc::clone(&self.deadlines);
        let on_fire = Arc::clone(&self.on_fire);
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let mut pending = deadlines.lock();
                    match pending.get(&key) {
                        Some(deadline) if Instant::now() >= *deadline => {
                            pending.remove(&key);
                            break;
                        }
                        Some(deadline) => *deadline,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;
            }
            on_fire(key);
        });
    }

    /// Forgets a pending trigger without firing it.
    pub fn cancel(&self, key: &str) -> bool {
        self.deadlines.lock().remove(key).is_some()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.deadlines.lock().contains_key(key)
    }
}
