//! Replicated record type and the events a store emits when records change
use std::cmp::Ordering;
use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Sentinel ttl for records that never expire
pub const TTL_INFINITY: i64 = i32::MIN as i64;

/// Key to record mapping used for floods, dumps and publications
pub type KeyVals = BTreeMap<String, Record>;

/// The unit of replication. The key lives outside the record, in the map
/// that carries it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Record {
    pub version: i64,
    pub originator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    pub ttl: i64,
    #[serde(default)]
    pub ttl_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<i64>,
}

impl Record {
    pub fn new(version: i64, originator_id: &str, value: Option<Vec<u8>>, ttl: i64) -> Self {
        let mut record = Self {
            version,
            originator_id: originator_id.to_string(),
            value,
            ttl,
            ttl_version: 0,
            hash: None,
        };
        record.update_hash();
        record
    }

    pub fn with_ttl_version(mut self, ttl_version: i64) -> Self {
        self.ttl_version = ttl_version;
        self
    }

    pub fn has_infinite_ttl(&self) -> bool {
        self.ttl == TTL_INFINITY
    }

    /// A record without a value only refreshes the ttl of an existing one
    pub fn is_ttl_only(&self) -> bool {
        self.value.is_none()
    }

    /// Copy of this record with the payload cleared, hash retained
    pub fn without_value(&self) -> Self {
        Self {
            value: None,
            ..self.clone()
        }
    }

    /// Recompute the digest; records without a value keep whatever hash they carry
    pub fn update_hash(&mut self) {
        if let Some(value) = &self.value {
            self.hash = Some(record_hash(self.version, &self.originator_id, value));
        }
    }
}

/// Stable digest of `(version, originator, value)`
pub fn record_hash(version: i64, originator_id: &str, value: &[u8]) -> i64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(originator_id.as_bytes());
    hasher.update(value);
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_be_bytes(head)
}

/// Compare two ttls where `TTL_INFINITY` outranks every finite value
pub fn compare_ttl(left: i64, right: i64) -> Ordering {
    match (left == TTL_INFINITY, right == TTL_INFINITY) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.cmp(&right),
    }
}

/// Order two records by content: version, then originator, then value.
///
/// Value presence beats absence, so a content update wins over a bare ttl
/// refresh carrying the same version and originator. Two present values are
/// ordered by their bytes. `Equal` means the records carry the same content and
/// may differ only in ttl bookkeeping.
pub fn compare_content(left: &Record, right: &Record) -> Ordering {
    left.version
        .cmp(&right.version)
        .then_with(|| left.originator_id.cmp(&right.originator_id))
        .then_with(|| match (&left.value, &right.value) {
            (Some(l), Some(r)) => l.cmp(r),
            (Some(_), None) | (None, Some(_)) => {
                // A ttl-only record stands for the content whose hash it carries
                if left.hash.is_some() && left.hash == right.hash {
                    Ordering::Equal
                } else if left.value.is_some() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (None, None) => Ordering::Equal,
        })
}

/// Compare a local record against a peer's hash-only copy during full sync.
///
/// `None` means the two cannot be ordered without the payload (same version
/// and originator, different or missing hashes); both sides then send theirs.
pub fn compare_for_sync(local: &Record, remote: &Record) -> Option<Ordering> {
    match local
        .version
        .cmp(&remote.version)
        .then_with(|| local.originator_id.cmp(&remote.originator_id))
    {
        Ordering::Equal => {}
        other => return Some(other),
    }
    match (local.hash, remote.hash) {
        (Some(l), Some(r)) if l == r => Some(local.ttl_version.cmp(&remote.ttl_version)),
        _ => None,
    }
}

/// Queue `record` for `key` behind whatever is already waiting there.
///
/// A record with the same content folds its ttl into the waiting one and
/// keeps any value either side carries, so a refresh never strips a pending
/// update. Newer content replaces the waiting record; older content is
/// dropped.
pub fn fold_pending(pending: &mut KeyVals, key: String, record: Record) {
    let Some(waiting) = pending.get_mut(&key) else {
        pending.insert(key, record);
        return;
    };
    let same_content = waiting.version == record.version
        && waiting.originator_id == record.originator_id
        && (record.is_ttl_only()
            || waiting.is_ttl_only()
            || compare_content(waiting, &record) == Ordering::Equal);
    if same_content {
        if waiting.value.is_none() {
            waiting.value = record.value;
            waiting.hash = record.hash.or(waiting.hash);
        }
        waiting.ttl = record.ttl;
        waiting.ttl_version = waiting.ttl_version.max(record.ttl_version);
    } else if compare_content(&record, waiting) == Ordering::Greater {
        *waiting = record;
    }
}

/// Change notifications produced by the store and consumed by the flooding
/// and subscription engines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// New content was stored for a key
    ValueUpdated { key: String, record: Record },
    /// Same content, refreshed ttl (`record.value` is `None`)
    TtlRefreshed { key: String, record: Record },
    /// The key was removed after its ttl ran out; `record` is the last copy held
    Expired { key: String, record: Record },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::ValueUpdated { key, .. }
            | StoreEvent::TtlRefreshed { key, .. }
            | StoreEvent::Expired { key, .. } => key,
        }
    }
}

/// A batch of changes for one area as delivered to readers and subscribers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub area: String,
    pub key_vals: KeyVals,
    #[serde(default)]
    pub expired_keys: Vec<String>,
}

impl Publication {
    pub fn new(area: &str) -> Self {
        Self {
            area: area.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}
