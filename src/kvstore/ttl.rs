//! TTL Manager
//!
//! Ages the records of one area on every tick and keeps locally originated
//! records alive on remote replicas by re-publishing ttl-only updates.
use std::collections::HashMap;

use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::record::{Record, StoreEvent, TTL_INFINITY};
use super::store::RecordStore;

/// What one tick changed
#[derive(Debug, Default)]
pub struct TtlTick {
    /// Keys that ran out, as `StoreEvent::Expired`
    pub expired: Vec<StoreEvent>,
    /// Ttl-only refreshes of our own keys, ready to flood
    pub refreshed: Vec<(String, Record)>,
}

#[derive(Debug)]
pub struct TtlManager {
    key_ttl_ms: i64,
    last_tick: Instant,
    /// Locally originated keys and when each is next refreshed
    local_keys: HashMap<String, Instant>,
}

impl TtlManager {
    pub fn new(key_ttl_ms: i64) -> Self {
        Self {
            key_ttl_ms,
            last_tick: Instant::now(),
            local_keys: HashMap::new(),
        }
    }

    pub fn key_ttl_ms(&self) -> i64 {
        self.key_ttl_ms
    }

    /// A quarter of the key ttl, jittered by up to 10% either way so that
    /// refreshes from many keys do not line up
    pub fn refresh_interval(&self) -> Duration {
        let base = (self.key_ttl_ms.max(4) / 4) as u64;
        let spread = base / 10;
        let jittered = rand::rng().random_range(base - spread..=base + spread);
        Duration::from_millis(jittered.max(1))
    }

    /// Start refreshing `key` on behalf of this node
    pub fn track_local(&mut self, key: &str) {
        if self.key_ttl_ms == TTL_INFINITY {
            return;
        }
        let next = Instant::now() + self.refresh_interval();
        self.local_keys.insert(key.to_string(), next);
    }

    /// Stop refreshing `key`; replicas will let it expire
    pub fn untrack_local(&mut self, key: &str) -> bool {
        self.local_keys.remove(key).is_some()
    }

    pub fn is_local(&self, key: &str) -> bool {
        self.local_keys.contains_key(key)
    }

    pub fn local_key_count(&self) -> usize {
        self.local_keys.len()
    }

    pub fn tick(&mut self, store: &mut RecordStore, originator_id: &str, now: Instant) -> TtlTick {
        let elapsed_ms = now.saturating_duration_since(self.last_tick).as_millis() as i64;
        self.last_tick = now;

        let expired = if elapsed_ms > 0 {
            store.age(elapsed_ms)
        } else {
            Vec::new()
        };
        for event in expired.iter() {
            if self.local_keys.remove(event.key()).is_some() {
                debug!("[{}] Local key '{}' expired", store.area(), event.key());
            }
        }

        let due: Vec<String> = self
            .local_keys
            .iter()
            .filter(|(_, next)| **next <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut refreshed = Vec::with_capacity(due.len());
        for key in due {
            let owned = store
                .get(&key)
                .map(|r| r.originator_id == originator_id)
                .unwrap_or(false);
            if !owned {
                // Overwritten by another originator, or gone
                self.local_keys.remove(&key);
                continue;
            }
            if let Some(record) = store.refresh_ttl(&key, self.key_ttl_ms) {
                refreshed.push((key.clone(), record));
            }
            let next = now + self.refresh_interval();
            self.local_keys.insert(key, next);
        }

        TtlTick { expired, refreshed }
    }
}
