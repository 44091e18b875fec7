//! Per-device failure registry.
//!
//! A device that failed is left alone until a cooldown has passed, so one
//! unreachable logger does not cost a full Modbus timeout every cycle.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct CircuitBreaker<K> {
    cooldown: Duration,
    failed: HashMap<K, Instant>,
}

impl<K> Default for CircuitBreaker<K> {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl<K> CircuitBreaker<K> {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            failed: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Copy + Display> CircuitBreaker<K> {
    pub fn should_skip(&mut self, id: K) -> bool {
        self.should_skip_at(id, Instant::now())
    }

    /// True while the last failure of `id` is younger than the cooldown.
    /// An expired entry is dropped.
    pub fn should_skip_at(&mut self, id: K, now: Instant) -> bool {
        match self.failed.get(&id) {
            Some(failed_at) if now.saturating_duration_since(*failed_at) < self.cooldown => true,
            Some(_) => {
                self.failed.remove(&id);
                false
            }
            None => false,
        }
    }

    pub fn on_failure(&mut self, id: K) {
        self.on_failure_at(id, Instant::now());
    }

    pub fn on_failure_at(&mut self, id: K, now: Instant) {
        self.failed.insert(id, now);
        warn!(device = %id, cooldown = ?self.cooldown, "Marked failed");
    }

    pub fn on_success(&mut self, id: K) {
        if self.failed.remove(&id).is_some() {
            info!(device = %id, "Recovered");
        }
    }

    pub fn is_open(&self, id: K) -> bool {
        self.failed.contains_key(&id)
    }
}
