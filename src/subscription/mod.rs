//! Subscription Engine
//!
//! Filtered change streams for local consumers. Every subscriber has its own
//! bounded `broadcast` queue: a slow reader loses the oldest publications and
//! sees a backpressure error, it never slows down the area.
use std::collections::BTreeMap;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::error::{KvError, Result};
use crate::kvstore::filter::CompiledFilter;
use crate::kvstore::record::{Publication, StoreEvent};
use crate::kvstore::store::RecordStore;

/// Publications merged from one or more areas. The stream ends after the
/// first error.
pub type PublicationStream = Pin<Box<dyn Stream<Item = Result<Publication>> + Send>>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCounters {
    pub subscribers_added: u64,
    pub subscribers_removed: u64,
    pub publications_sent: u64,
}

#[derive(Debug)]
struct Subscriber {
    filter: CompiledFilter,
    tx: broadcast::Sender<Publication>,
}

#[derive(Debug)]
pub struct SubscriptionEngine {
    area: String,
    queue_size: usize,
    subscribers: BTreeMap<u64, Subscriber>,
    next_id: u64,
    counters: SubscriptionCounters,
}

impl SubscriptionEngine {
    pub fn new(area: &str, queue_size: usize) -> Self {
        Self {
            area: area.to_string(),
            queue_size: queue_size.max(1),
            subscribers: BTreeMap::new(),
            next_id: 0,
            counters: SubscriptionCounters::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn counters(&self) -> &SubscriptionCounters {
        &self.counters
    }

    /// Register a subscriber and return the snapshot it starts from.
    ///
    /// Runs inside the area actor, so no event can fall between the snapshot
    /// and the first publication on the receiver.
    pub fn subscribe(
        &mut self,
        filter: CompiledFilter,
        store: &RecordStore,
    ) -> (Publication, broadcast::Receiver<Publication>) {
        let mut snapshot = Publication::new(&self.area);
        snapshot.key_vals = store
            .dump(&filter)
            .map(|(key, record)| (key.clone(), filter.shape(record)))
            .collect();

        let (tx, rx) = broadcast::channel(self.queue_size);
        self.next_id += 1;
        self.subscribers.insert(self.next_id, Subscriber { filter, tx });
        self.counters.subscribers_added += 1;
        debug!(
            "[{}] Subscriber {} added with {} keys in snapshot",
            self.area,
            self.next_id,
            snapshot.key_vals.len()
        );
        (snapshot, rx)
    }

    /// Deliver store events to every matching subscriber
    pub fn publish(&mut self, events: &[StoreEvent]) {
        if events.is_empty() || self.subscribers.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        for (id, subscriber) in self.subscribers.iter() {
            let publication = self.publication_for(&subscriber.filter, events);
            if publication.is_empty() {
                continue;
            }
            match subscriber.tx.send(publication) {
                Ok(_) => self.counters.publications_sent += 1,
                Err(_) => closed.push(*id),
            }
        }
        for id in closed {
            self.remove(id);
        }
    }

    fn publication_for(&self, filter: &CompiledFilter, events: &[StoreEvent]) -> Publication {
        let mut publication = Publication::new(&self.area);
        for event in events {
            match event {
                StoreEvent::ValueUpdated { key, record } => {
                    if filter.matches(key, record) {
                        publication.key_vals.insert(key.clone(), filter.shape(record));
                    }
                }
                StoreEvent::TtlRefreshed { key, record } => {
                    if !filter.ignore_ttl() && filter.matches(key, record) {
                        // Never replace a value update from the same batch
                        publication
                            .key_vals
                            .entry(key.clone())
                            .and_modify(|held| {
                                held.ttl = record.ttl;
                                held.ttl_version = record.ttl_version;
                            })
                            .or_insert_with(|| filter.shape(record));
                    }
                }
                StoreEvent::Expired { key, record } => {
                    if filter.matches(key, record) {
                        publication.key_vals.remove(key);
                        publication.expired_keys.push(key.clone());
                    }
                }
            }
        }
        publication
    }

    /// Drop subscribers whose streams were dropped
    pub fn purge_closed(&mut self) -> usize {
        let closed: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.tx.receiver_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        let count = closed.len();
        for id in closed {
            self.remove(id);
        }
        count
    }

    fn remove(&mut self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            self.counters.subscribers_removed += 1;
            debug!("[{}] Subscriber {} removed", self.area, id);
        }
    }
}

/// Merge per-area receivers into one stream. Falling behind surfaces as
/// `KvError::SubscriberBackpressure` and ends the stream; the consumer has to
/// subscribe again for a fresh snapshot.
pub fn merge_receivers(receivers: Vec<broadcast::Receiver<Publication>>) -> PublicationStream {
    let merged = stream::select_all(receivers.into_iter().map(|rx| {
        BroadcastStream::new(rx).map(|item| {
            item.map_err(|e: BroadcastStreamRecvError| {
                KvError::SubscriberBackpressure(format!("Subscriber fell behind: {}", e))
            })
        })
    }));
    let stream = merged.scan(false, |failed, item| {
        if *failed {
            return futures::future::ready(None);
        }
        *failed = item.is_err();
        futures::future::ready(Some(item))
    });
    Box::pin(stream)
}
