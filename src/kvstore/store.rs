//! Versioned Record Store
//!
//! Holds the records of one area and decides, through `merge`, which of two
//! replicas of a key survives. Every mutation of area state goes through here.
use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::filter::CompiledFilter;
use super::record::{compare_content, compare_ttl, KeyVals, Record, StoreEvent};

/// Result of merging one incoming record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The stored record changed; the event describes how
    Accepted(StoreEvent),
    /// The incoming record is older than (or cannot apply to) what we hold
    Rejected,
    /// Nothing observable changed
    NoOp,
}

impl MergeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MergeOutcome::Accepted(_))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounters {
    pub accepted: u64,
    pub rejected: u64,
    pub no_op: u64,
    pub expired: u64,
}

#[derive(Clone, Debug)]
pub struct RecordStore {
    area: String,
    records: HashMap<String, Record>,
    counters: StoreCounters,
}

impl RecordStore {
    pub fn new(area: &str) -> Self {
        Self {
            area: area.to_string(),
            records: HashMap::new(),
            counters: StoreCounters::default(),
        }
    }

    pub fn area(&self) -> &str {
        &self.area
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Look up several keys at once; unknown keys are left out
    pub fn get_many<'a, I>(&self, keys: I) -> KeyVals
    where
        I: IntoIterator<Item = &'a String>,
    {
        keys.into_iter()
            .filter_map(|key| self.records.get(key).map(|r| (key.clone(), r.clone())))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> + '_ {
        self.records.keys()
    }

    /// Matching `(key, record)` pairs. Calling it again restarts the walk.
    pub fn dump<'a>(
        &'a self,
        filter: &'a CompiledFilter,
    ) -> impl Iterator<Item = (&'a String, &'a Record)> + 'a {
        self.records
            .iter()
            .filter(move |(key, record)| filter.matches(key, record))
    }

    /// Same as `dump`, with every value cleared
    pub fn dump_hashes<'a>(
        &'a self,
        filter: &'a CompiledFilter,
    ) -> impl Iterator<Item = (String, Record)> + 'a {
        self.dump(filter)
            .map(|(key, record)| (key.clone(), record.without_value()))
    }

    /// Merge an incoming replica of `key` into the store.
    pub fn merge(&mut self, key: &str, incoming: Record) -> MergeOutcome {
        let outcome = self.merge_inner(key, incoming);
        match &outcome {
            MergeOutcome::Accepted(_) => self.counters.accepted += 1,
            MergeOutcome::Rejected => self.counters.rejected += 1,
            MergeOutcome::NoOp => self.counters.no_op += 1,
        }
        outcome
    }

    fn merge_inner(&mut self, key: &str, mut incoming: Record) -> MergeOutcome {
        if !incoming.has_infinite_ttl() && incoming.ttl <= 0 {
            debug!(
                "[{}] Rejecting '{}': ttl {} already ran out",
                self.area, key, incoming.ttl
            );
            return MergeOutcome::Rejected;
        }

        let Some(existing) = self.records.get_mut(key) else {
            if incoming.is_ttl_only() {
                // Nothing to refresh
                return MergeOutcome::Rejected;
            }
            incoming.update_hash();
            self.records.insert(key.to_string(), incoming.clone());
            return MergeOutcome::Accepted(StoreEvent::ValueUpdated {
                key: key.to_string(),
                record: incoming,
            });
        };

        if incoming.is_ttl_only() {
            let same_content = incoming.version == existing.version
                && incoming.originator_id == existing.originator_id
                && (incoming.hash.is_none() || incoming.hash == existing.hash);
            if !same_content {
                return MergeOutcome::Rejected;
            }
        } else {
            match compare_content(&incoming, existing) {
                Ordering::Greater => {
                    incoming.update_hash();
                    *existing = incoming.clone();
                    return MergeOutcome::Accepted(StoreEvent::ValueUpdated {
                        key: key.to_string(),
                        record: incoming,
                    });
                }
                Ordering::Less => return MergeOutcome::Rejected,
                Ordering::Equal => {}
            }
        }

        // Same content: keep it, fold in the ttl bookkeeping
        let ttl_extended = compare_ttl(incoming.ttl, existing.ttl) == Ordering::Greater;
        if ttl_extended {
            existing.ttl = incoming.ttl;
        }
        if incoming.ttl_version > existing.ttl_version {
            existing.ttl_version = incoming.ttl_version;
            return MergeOutcome::Accepted(StoreEvent::TtlRefreshed {
                key: key.to_string(),
                record: existing.without_value(),
            });
        }
        MergeOutcome::NoOp
    }

    /// Originate or update a record owned by `originator_id`.
    ///
    /// The version is bumped past whatever the store holds, so the write wins
    /// everywhere. Writing the value we already own only refreshes its ttl.
    pub fn set_local(
        &mut self,
        originator_id: &str,
        key: &str,
        value: Vec<u8>,
        ttl: i64,
    ) -> MergeOutcome {
        let record = match self.records.get(key) {
            Some(existing)
                if existing.originator_id == originator_id
                    && existing.value.as_deref() == Some(value.as_slice()) =>
            {
                let mut refreshed = existing.clone();
                refreshed.ttl = ttl;
                refreshed.ttl_version += 1;
                refreshed
            }
            Some(existing) => Record::new(existing.version + 1, originator_id, Some(value), ttl),
            None => Record::new(1, originator_id, Some(value), ttl),
        };
        self.merge(key, record)
    }

    /// Bump the ttl version of a record we hold, returning the ttl-only copy to flood
    pub fn refresh_ttl(&mut self, key: &str, ttl: i64) -> Option<Record> {
        let record = self.records.get_mut(key)?;
        record.ttl = ttl;
        record.ttl_version += 1;
        Some(record.without_value())
    }

    /// Age every finite record by `elapsed_ms` and drop the ones that ran out
    pub fn age(&mut self, elapsed_ms: i64) -> Vec<StoreEvent> {
        let mut expired = Vec::new();
        self.records.retain(|key, record| {
            if record.has_infinite_ttl() {
                return true;
            }
            record.ttl -= elapsed_ms;
            if record.ttl <= 0 {
                expired.push(StoreEvent::Expired {
                    key: key.clone(),
                    record: record.without_value(),
                });
                false
            } else {
                true
            }
        });
        self.counters.expired += expired.len() as u64;
        expired
    }

    pub fn erase(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }
}
