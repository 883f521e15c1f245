//! Flooding Engine
//!
//! Turns accepted records into outbound flood batches: decrements their ttl
//! for the next hop, enforces the area's flood rate and leaf filter, and
//! decides which peers each batch goes to.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::rate_limit::FloodRateLimiter;
use super::spt::SptManager;
use crate::kvstore::filter::CompiledFilter;
use crate::kvstore::record::{fold_pending, KeyVals, Record};
use crate::node::NodeName;
use crate::settings::FloodRate;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodCounters {
    /// Batches handed to the peer manager
    pub batches_flooded: u64,
    pub records_flooded: u64,
    /// Records held back by the rate limiter
    pub records_buffered: u64,
    /// Peer records ignored by the leaf filter
    pub records_filtered: u64,
    /// Records whose ttl ran out before the next hop
    pub records_ttl_dropped: u64,
}

#[derive(Debug)]
pub struct FloodEngine {
    area: String,
    ttl_decrement_ms: i64,
    rate_limiter: Option<FloodRateLimiter>,
    /// Latest record per key waiting for a flood token
    pending: KeyVals,
    /// When each pending record's ttl was last set
    held_since: BTreeMap<String, Instant>,
    flood_filter: Option<CompiledFilter>,
    counters: FloodCounters,
}

impl FloodEngine {
    pub fn new(
        area: &str,
        ttl_decrement_ms: i64,
        flood_rate: Option<&FloodRate>,
        flood_filter: Option<CompiledFilter>,
    ) -> Self {
        Self {
            area: area.to_string(),
            ttl_decrement_ms,
            rate_limiter: flood_rate.map(FloodRateLimiter::new),
            pending: KeyVals::new(),
            held_since: BTreeMap::new(),
            flood_filter,
            counters: FloodCounters::default(),
        }
    }

    pub fn counters(&self) -> &FloodCounters {
        &self.counters
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Leaf-node filter for records received from peers. Local writes never
    /// go through here.
    pub fn accept_from_peer(&mut self, key: &str, record: &Record) -> bool {
        match &self.flood_filter {
            Some(filter) if !filter.matches(key, record) => {
                self.counters.records_filtered += 1;
                false
            }
            _ => true,
        }
    }

    /// Copies for the next hop: finite ttls shrink by the per-hop decrement
    /// and records that would reach zero are dropped.
    pub fn prepare(&mut self, key_vals: KeyVals) -> KeyVals {
        let mut out = KeyVals::new();
        for (key, mut record) in key_vals {
            if !record.has_infinite_ttl() {
                if record.ttl <= self.ttl_decrement_ms {
                    self.counters.records_ttl_dropped += 1;
                    continue;
                }
                record.ttl -= self.ttl_decrement_ms;
            }
            out.insert(key, record);
        }
        out
    }

    /// Prepare `key_vals` and pass them through the rate limiter. `None` means
    /// nothing should be sent now; buffered records go out from `flush`.
    pub fn admit(&mut self, key_vals: KeyVals) -> Option<KeyVals> {
        let key_vals = self.prepare(key_vals);
        if key_vals.is_empty() {
            return None;
        }
        let Some(limiter) = self.rate_limiter.as_mut() else {
            return Some(key_vals);
        };
        // Keep ordering: nothing overtakes records already waiting
        if self.pending.is_empty() && limiter.try_acquire() {
            return Some(key_vals);
        }
        self.counters.records_buffered += key_vals.len() as u64;
        for (key, record) in key_vals {
            self.buffer(key, record);
        }
        debug!(
            "[{}] Flood rate exceeded, {} records buffered",
            self.area,
            self.pending.len()
        );
        None
    }

    fn buffer(&mut self, key: String, record: Record) {
        self.held_since.insert(key.clone(), Instant::now());
        fold_pending(&mut self.pending, key, record);
    }

    /// Release buffered records if a token is available. Finite ttls lose the
    /// time the records spent waiting; records whose ttl ran out meanwhile are
    /// dropped.
    pub fn flush(&mut self) -> Option<KeyVals> {
        if self.pending.is_empty() {
            return None;
        }
        let limiter = self.rate_limiter.as_mut()?;
        if !limiter.try_acquire() {
            return None;
        }
        let now = Instant::now();
        let mut held_since = std::mem::take(&mut self.held_since);
        let mut out = KeyVals::new();
        for (key, mut record) in std::mem::take(&mut self.pending) {
            if !record.has_infinite_ttl() {
                let held_ms = held_since
                    .remove(&key)
                    .map(|since| now.duration_since(since).as_millis() as i64)
                    .unwrap_or(0);
                if record.ttl <= held_ms {
                    self.counters.records_ttl_dropped += 1;
                    continue;
                }
                record.ttl -= held_ms;
            }
            out.insert(key, record);
        }
        if out.is_empty() {
            return None;
        }
        Some(out)
    }

    /// Peers a batch goes to: the spanning-tree neighbors of the elected root
    /// when one is reachable, every peer otherwise. The sender never gets its
    /// own records back.
    pub fn targets<'a, I>(
        &self,
        peers: I,
        spt: Option<&SptManager>,
        sender: Option<&NodeName>,
    ) -> Vec<NodeName>
    where
        I: IntoIterator<Item = &'a NodeName>,
    {
        let tree: Option<BTreeSet<NodeName>> = spt.and_then(|spt| spt.flood_peers());
        peers
            .into_iter()
            .filter(|peer| Some(*peer) != sender)
            .filter(|peer| tree.as_ref().map(|t| t.contains(*peer)).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn record_flooded(&mut self, key_vals: &KeyVals) {
        self.counters.batches_flooded += 1;
        self.counters.records_flooded += key_vals.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flood::dual::FloodTopoSetParams;
    use crate::kvstore::filter::KvFilter;
    use crate::kvstore::record::TTL_INFINITY;

    fn kv(entries: &[(&str, i64)]) -> KeyVals {
        entries
            .iter()
            .map(|(k, ttl)| (k.to_string(), Record::new(1, "node1", Some(vec![1]), *ttl)))
            .collect()
    }

    fn n(name: &str) -> NodeName {
        NodeName::from(name)
    }

    #[test]
    fn test_prepare_decrements_and_drops() {
        let mut engine = FloodEngine::new("0", 10, None, None);
        let out = engine.prepare(kv(&[("a", 100), ("b", 10), ("c", TTL_INFINITY)]));
        assert_eq!(out["a"].ttl, 90);
        assert!(!out.contains_key("b"));
        assert_eq!(out["c"].ttl, TTL_INFINITY);
        assert_eq!(engine.counters().records_ttl_dropped, 1);
    }

    #[test]
    fn test_rate_limited_floods_are_buffered_latest_per_key() {
        let rate = FloodRate {
            flood_msg_per_sec: 1,
            flood_msg_burst_size: 1,
        };
        let mut engine = FloodEngine::new("0", 1, Some(&rate), None);
        assert!(engine.admit(kv(&[("a", 100)])).is_some());
        assert!(engine.admit(kv(&[("a", 100)])).is_none());

        let mut newer = KeyVals::new();
        newer.insert("a".to_string(), Record::new(2, "node1", Some(vec![2]), 100));
        assert!(engine.admit(newer).is_none());
        assert_eq!(engine.pending_len(), 1);

        // Out of tokens until a second passes
        assert!(engine.flush().is_none());
        assert_eq!(engine.pending_len(), 1);
    }

    #[test]
    fn test_buffered_refresh_keeps_value() {
        let rate = FloodRate {
            flood_msg_per_sec: 1,
            flood_msg_burst_size: 1,
        };
        let mut engine = FloodEngine::new("0", 1, Some(&rate), None);
        engine.admit(kv(&[("warmup", 100)]));
        engine.admit(kv(&[("a", 100)]));

        let mut refresh = KeyVals::new();
        refresh.insert(
            "a".to_string(),
            Record::new(1, "node1", None, 500).with_ttl_version(1),
        );
        engine.admit(refresh);
        assert_eq!(engine.pending["a"].value, Some(vec![1]));
        assert_eq!(engine.pending["a"].ttl_version, 1);
        assert_eq!(engine.pending["a"].ttl, 499);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ages_records_by_time_held() {
        let rate = FloodRate {
            flood_msg_per_sec: 100,
            flood_msg_burst_size: 1,
        };
        let mut engine = FloodEngine::new("0", 1, Some(&rate), None);
        assert!(engine.admit(kv(&[("warmup", 100)])).is_some());
        assert!(engine
            .admit(kv(&[("long", 1000), ("short", 150), ("forever", TTL_INFINITY)]))
            .is_none());

        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        // The token bucket runs on wall-clock time
        std::thread::sleep(std::time::Duration::from_millis(20));

        let flushed = engine.flush().unwrap();
        assert_eq!(flushed["long"].ttl, 799);
        assert!(!flushed.contains_key("short"));
        assert_eq!(flushed["forever"].ttl, TTL_INFINITY);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.counters().records_ttl_dropped, 1);
    }

    #[test]
    fn test_unlimited_flush_is_noop() {
        let mut engine = FloodEngine::new("0", 1, None, None);
        assert!(engine.admit(kv(&[("a", 100)])).is_some());
        assert!(engine.flush().is_none());
    }

    #[test]
    fn test_leaf_filter() {
        let filter = KvFilter::with_keys(["adj:"]).compile().unwrap();
        let mut engine = FloodEngine::new("0", 1, None, Some(filter));
        let record = Record::new(1, "node2", Some(vec![1]), 100);
        assert!(engine.accept_from_peer("adj:node2", &record));
        assert!(!engine.accept_from_peer("prefix:node2", &record));
        assert_eq!(engine.counters().records_filtered, 1);
    }

    #[test]
    fn test_full_flood_targets_exclude_sender() {
        let engine = FloodEngine::new("0", 1, None, None);
        let peers = [n("b"), n("c"), n("d")];
        let targets = engine.targets(peers.iter(), None, Some(&n("c")));
        assert_eq!(targets, vec![n("b"), n("d")]);
    }

    #[test]
    fn test_tree_targets_follow_children() {
        let engine = FloodEngine::new("0", 1, None, None);
        let mut spt = SptManager::new(n("a"), Some(0));
        for peer in ["b", "c", "d"] {
            spt.peer_up(&n(peer));
        }
        spt.set_flood_root_child(&FloodTopoSetParams {
            root_id: n("a"),
            child: n("b"),
            set_child: true,
        });
        let peers = [n("b"), n("c"), n("d")];
        assert_eq!(engine.targets(peers.iter(), Some(&spt), None), vec![n("b")]);
        assert!(engine
            .targets(peers.iter(), Some(&spt), Some(&n("b")))
            .is_empty());
    }
}
