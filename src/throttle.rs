//! Per-key emission throttle.
//!
//! Used to gate outbound device-update broadcasts, and reused with other
//! intervals for the ingestion burst filter and the online/offline log
//! anti-spam. A `false` answer means drop, never queue: the state store
//! already holds the latest value, so only a notification is lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{elapsed, Clock};
use crate::keyed::lock;

// ---

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

pub struct Throttler {
    // ---
    interval: Duration,
    clock: Arc<dyn Clock>,
    last_emit: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Throttler {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            last_emit: Mutex::new(HashMap::new()),
        }
    }

    /// True, and the key's timestamp is updated, when at least `interval`
    /// has passed since the last emission for `key`.
    pub fn should_emit(&self, key: &str) -> bool {
        // ---
        let now = self.clock.now();
        let mut last_emit = lock(&self.last_emit);
        let due = last_emit
            .get(key)
            .map_or(true, |last| elapsed(*last, now) >= self.interval);
        if due {
            last_emit.insert(key.to_string(), now);
        }
        due
    }
}
