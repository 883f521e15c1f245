//! Area actor
//!
//! One task per area owns the record store, ttl manager, flooding engine,
//! spanning tree, peers and subscribers of that area. Everything reaches it
//! as an `AreaCommand` or a `PeerEvent`, so area state needs no locks.
use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::commands::AreaCommand;
use super::messages::{AreaSummary, MergeSummary};
use crate::error::{KvError, Result};
use crate::flood::engine::FloodEngine;
use crate::flood::spt::{SptManager, SptOutput};
use crate::kvstore::filter::CompiledFilter;
use crate::kvstore::record::{compare_for_sync, KeyVals, Publication, StoreEvent};
use crate::kvstore::store::{MergeOutcome, RecordStore};
use crate::kvstore::ttl::TtlManager;
use crate::node::NodeName;
use crate::peers::{PeerEvent, PeerManager, SyncState};
use crate::settings::{AreaSettings, KvStoreSettings};
use crate::subscription::SubscriptionEngine;
use crate::transport::{PeerMessage, PeerPacket, PeerTransport};
use crate::validation_error;

pub struct AreaController {
    area: String,
    node: NodeName,
    ttl_tick: Duration,
    flood_tick: Duration,
    store: RecordStore,
    ttl: TtlManager,
    flood: FloodEngine,
    spt: Option<SptManager>,
    peers: PeerManager,
    subs: SubscriptionEngine,
    peer_events_rx: mpsc::Receiver<PeerEvent>,
}

impl std::fmt::Debug for AreaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AreaController")
            .field("area", &self.area)
            .field("node", &self.node)
            .field("keys", &self.store.len())
            .field("peers", &self.peers.len())
            .field("flood_optimization", &self.spt.is_some())
            .finish()
    }
}

impl AreaController {
    pub fn new(
        node: NodeName,
        area_settings: &AreaSettings,
        kv_settings: &KvStoreSettings,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let area = area_settings.area_id.clone();
        let flood_filter = area_settings
            .flood_filter
            .as_ref()
            .map(|f| f.compile())
            .transpose()?;
        let (peer_events_tx, peer_events_rx) = mpsc::channel(kv_settings.peer_queue_size);
        let spt = area_settings
            .enable_flood_optimization
            .then(|| SptManager::new(node.clone(), area_settings.flood_root_priority));

        Ok(Self {
            store: RecordStore::new(&area),
            ttl: TtlManager::new(kv_settings.key_ttl_ms),
            flood: FloodEngine::new(
                &area,
                kv_settings.ttl_decrement_ms,
                area_settings.flood_rate.as_ref(),
                flood_filter,
            ),
            spt,
            peers: PeerManager::new(&area, node.clone(), transport, peer_events_tx, kv_settings),
            subs: SubscriptionEngine::new(&area, kv_settings.subscriber_queue_size),
            ttl_tick: Duration::from_millis(kv_settings.ttl_tick_ms),
            flood_tick: Duration::from_millis(kv_settings.flood_tick_ms),
            peer_events_rx,
            area,
            node,
        })
    }

    pub fn area(&self) -> &str {
        &self.area
    }

    /// Run the actor until every command sender is dropped
    pub async fn start(mut self, mut command_rx: mpsc::Receiver<AreaCommand>) {
        info!(
            "[{}/{}] Starting area loop (ttl tick {:?}, flood tick {:?}, flood optimization {})",
            self.node,
            self.area,
            self.ttl_tick,
            self.flood_tick,
            self.spt.is_some()
        );
        let mut ttl_timer = time::interval(self.ttl_tick);
        let mut flood_timer = time::interval(self.flood_tick);
        ttl_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        flood_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("[{}/{}] Command channel closed, exiting", self.node, self.area);
                            break;
                        }
                    }
                }
                Some(event) = self.peer_events_rx.recv() => {
                    self.handle_peer_event(event);
                }
                _ = ttl_timer.tick() => {
                    self.handle_ttl_tick(Instant::now());
                }
                _ = flood_timer.tick() => {
                    self.handle_flood_tick();
                }
            }
        }
    }

    pub fn handle_command(&mut self, cmd: AreaCommand) {
        match cmd {
            AreaCommand::GetKeyVals { keys, resp_chan } => {
                let mut publication = Publication::new(&self.area);
                publication.key_vals = self.store.get_many(keys.iter());
                self.respond(resp_chan, Ok(publication), "get_key_vals");
            }
            AreaCommand::GetKeyValsFiltered { filter, resp_chan } => {
                let mut publication = Publication::new(&self.area);
                publication.key_vals = self
                    .store
                    .dump(&filter)
                    .map(|(key, record)| (key.clone(), filter.shape(record)))
                    .collect();
                self.respond(resp_chan, Ok(publication), "get_key_vals_filtered");
            }
            AreaCommand::GetHashesFiltered { filter, resp_chan } => {
                let mut publication = Publication::new(&self.area);
                publication.key_vals = self.store.dump_hashes(&filter).collect();
                self.respond(resp_chan, Ok(publication), "get_hashes_filtered");
            }
            AreaCommand::SetKeyVals { key_vals, resp_chan } => {
                let result = self.set_key_vals(key_vals);
                self.respond(resp_chan, result, "set_key_vals");
            }
            AreaCommand::SetLocalKey {
                key,
                value,
                resp_chan,
            } => {
                let result = self.set_local_key(&key, value);
                self.respond(resp_chan, result, "set_local_key");
            }
            AreaCommand::UnsetLocalKey { key, resp_chan } => {
                let was_local = self.ttl.untrack_local(&key);
                debug!(
                    "[{}/{}] Unset local key '{}' (was local: {})",
                    self.node, self.area, key, was_local
                );
                self.respond(resp_chan, Ok(was_local), "unset_local_key");
            }
            AreaCommand::Subscribe { filter, resp_chan } => {
                let subscription = self.subs.subscribe(filter, &self.store);
                self.respond(resp_chan, Ok(subscription), "subscribe");
            }
            AreaCommand::Summary { resp_chan } => {
                let summary = self.summary();
                self.respond(resp_chan, Ok(summary), "summary");
            }
            AreaCommand::AddPeer {
                name,
                addr,
                resp_chan,
            } => {
                let result = self.add_peer(&name, &addr);
                self.respond(resp_chan, result, "add_peer");
            }
            AreaCommand::DelPeer { name, resp_chan } => {
                let removed = self.peers.del_peer(&name);
                if removed {
                    self.on_peer_down(&name);
                }
                self.respond(resp_chan, Ok(removed), "del_peer");
            }
            AreaCommand::GetPeers { resp_chan } => {
                let peers = self.peers.get_peers();
                self.respond(resp_chan, Ok(peers), "get_peers");
            }
            AreaCommand::ProcessFloodMessage {
                messages,
                resp_chan,
            } => {
                let result = match self.spt.as_mut() {
                    Some(spt) => {
                        let out = spt.process_dual_messages(&messages);
                        self.dispatch_spt(out);
                        Ok(())
                    }
                    None => Err(self.optimization_disabled()),
                };
                self.respond(resp_chan, result, "process_flood_message");
            }
            AreaCommand::SetFloodRootChild { params, resp_chan } => {
                let result = match self.spt.as_mut() {
                    Some(spt) => {
                        spt.set_flood_root_child(&params);
                        Ok(())
                    }
                    None => Err(self.optimization_disabled()),
                };
                self.respond(resp_chan, result, "set_flood_root_child");
            }
            AreaCommand::GetSpanningTreeInfo { resp_chan } => {
                let result = match self.spt.as_ref() {
                    Some(spt) => Ok(spt.info()),
                    None => Err(self.optimization_disabled()),
                };
                self.respond(resp_chan, result, "get_spanning_tree_info");
            }
            AreaCommand::PeerPacket { packet, resp_chan } => {
                let reply = self.handle_peer_packet(packet);
                if resp_chan.send(reply).is_err() {
                    debug!(
                        "[{}/{}] Peer went away before its response was ready",
                        self.node, self.area
                    );
                }
            }
        }
    }

    fn respond<T>(&self, resp_chan: tokio::sync::oneshot::Sender<Result<T>>, result: Result<T>, op: &str) {
        if resp_chan.send(result).is_err() {
            error!(
                "[{}/{}] Failed sending oneshot {} response",
                self.node, self.area, op
            );
        }
    }

    fn optimization_disabled(&self) -> KvError {
        validation_error!(
            "Flood optimization is not enabled for area {}",
            self.area
        )
    }

    fn summary(&self) -> AreaSummary {
        AreaSummary {
            area: self.area.clone(),
            key_count: self.store.len(),
            peer_count: self.peers.len(),
            local_key_count: self.ttl.local_key_count(),
            subscriber_count: self.subs.len(),
            store: self.store.counters().clone(),
            flood: self.flood.counters().clone(),
            subscriptions: self.subs.counters().clone(),
        }
    }

    fn set_key_vals(&mut self, key_vals: KeyVals) -> Result<MergeSummary> {
        if key_vals.keys().any(|k| k.is_empty()) {
            return Err(validation_error!("Empty key in set_key_vals"));
        }
        let mut summary = MergeSummary::default();
        let mut events = Vec::new();
        for (key, record) in key_vals {
            match self.store.merge(&key, record) {
                MergeOutcome::Accepted(event) => {
                    summary.accepted += 1;
                    events.push(event);
                }
                MergeOutcome::Rejected => summary.rejected += 1,
                MergeOutcome::NoOp => summary.no_op += 1,
            }
        }
        self.propagate(events, None);
        Ok(summary)
    }

    fn set_local_key(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(validation_error!("Empty key in set_local_key"));
        }
        let outcome = self
            .store
            .set_local(self.node.as_str(), key, value, self.ttl.key_ttl_ms());
        match outcome {
            MergeOutcome::Accepted(event) => {
                self.ttl.track_local(key);
                self.propagate(vec![event], None);
                Ok(())
            }
            MergeOutcome::NoOp => {
                self.ttl.track_local(key);
                Ok(())
            }
            MergeOutcome::Rejected => Err(validation_error!(
                "Local write of '{}' was rejected by the store",
                key
            )),
        }
    }

    fn add_peer(&mut self, name: &NodeName, addr: &str) -> Result<()> {
        if !self.peers.add_peer(name, addr)? {
            return Ok(());
        }
        let hashes: KeyVals = self
            .store
            .dump_hashes(&CompiledFilter::default())
            .collect();
        debug!(
            "[{}/{}] Starting full sync with {} ({} hashes)",
            self.node,
            self.area,
            name,
            hashes.len()
        );
        if let Err(e) = self.peers.send(name, PeerMessage::SyncRequest { hashes }) {
            warn!("[{}/{}] Could not start sync with {}: {}", self.node, self.area, name, e);
            return Ok(());
        }
        if let Some(spt) = self.spt.as_mut() {
            let out = spt.peer_up(name);
            self.dispatch_spt(out);
        }
        Ok(())
    }

    /// Merge records received from `sender`, dropping what the leaf filter rejects
    fn merge_from_peer(&mut self, sender: &NodeName, key_vals: KeyVals) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        for (key, record) in key_vals {
            if !self.flood.accept_from_peer(&key, &record) {
                continue;
            }
            if let MergeOutcome::Accepted(event) = self.store.merge(&key, record) {
                events.push(event);
            }
        }
        if !events.is_empty() {
            debug!(
                "[{}/{}] Accepted {} records from {}",
                self.node,
                self.area,
                events.len(),
                sender
            );
        }
        events
    }

    /// Publish accepted changes to subscribers and flood them onward
    fn propagate(&mut self, events: Vec<StoreEvent>, sender: Option<&NodeName>) {
        if events.is_empty() {
            return;
        }
        self.subs.publish(&events);
        let key_vals: KeyVals = events
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::ValueUpdated { key, record } | StoreEvent::TtlRefreshed { key, record } => {
                    Some((key, record))
                }
                StoreEvent::Expired { .. } => None,
            })
            .collect();
        if let Some(batch) = self.flood.admit(key_vals) {
            self.flood_to_peers(batch, sender);
        }
    }

    fn flood_to_peers(&mut self, key_vals: KeyVals, sender: Option<&NodeName>) {
        let targets = self
            .flood
            .targets(self.peers.active_peers(), self.spt.as_ref(), sender);
        if targets.is_empty() {
            return;
        }
        self.flood.record_flooded(&key_vals);
        for peer in targets {
            if let Err(e) = self.peers.enqueue_flood(&peer, &key_vals) {
                warn!("[{}/{}] Flood to {} failed: {}", self.node, self.area, peer, e);
                self.on_peer_down(&peer);
            }
        }
    }

    /// Send spanning-tree output to the peers it names
    fn dispatch_spt(&mut self, mut out: SptOutput) {
        if out.is_empty() {
            return;
        }
        let mut messages: Vec<(NodeName, PeerMessage)> = out
            .dual_batches(&self.node)
            .into_iter()
            .map(|(to, batch)| (to, PeerMessage::Dual(batch)))
            .collect();
        messages.extend(
            out.topo_sets
                .into_iter()
                .map(|(to, params)| (to, PeerMessage::FloodTopoSet(params))),
        );

        let mut failed = Vec::new();
        for (to, message) in messages {
            match self.peers.state(&to) {
                Some(SyncState::Syncing) | Some(SyncState::Synced) => {
                    if self.peers.send(&to, message).is_err() {
                        failed.push(to);
                    }
                }
                _ => debug!(
                    "[{}/{}] Dropping {} for unavailable peer {}",
                    self.node,
                    self.area,
                    message.kind(),
                    to
                ),
            }
        }
        for peer in failed {
            self.on_peer_down(&peer);
        }
    }

    fn on_peer_down(&mut self, peer: &NodeName) {
        if let Some(spt) = self.spt.as_mut() {
            let out = spt.peer_down(peer);
            self.dispatch_spt(out);
        }
    }

    /// A configured peer we gave up on is talking to us again: restart its
    /// sync before handling what it sent
    fn revive_peer(&mut self, sender: &NodeName) {
        let Some(addr) = self.peers.idle_addr(sender) else {
            return;
        };
        info!(
            "[{}/{}] Heard from idle peer {}, restarting sync",
            self.node, self.area, sender
        );
        if let Err(e) = self.add_peer(sender, &addr) {
            warn!("[{}/{}] Could not restart peer {}: {}", self.node, self.area, sender, e);
        }
    }

    pub fn handle_peer_packet(&mut self, packet: PeerPacket) -> PeerPacket {
        let PeerPacket {
            sender, message, ..
        } = packet;
        self.revive_peer(&sender);
        let reply = match message {
            PeerMessage::Flood { key_vals } | PeerMessage::FinalizeSync { key_vals } => {
                let events = self.merge_from_peer(&sender, key_vals);
                self.propagate(events, Some(&sender));
                PeerMessage::Ack
            }
            PeerMessage::SyncRequest { hashes } => self.sync_response(&sender, hashes),
            PeerMessage::Dual(batch) => {
                match self.spt.as_mut() {
                    Some(spt) if self.peers.contains(&sender) => {
                        let out = spt.process_dual_messages(&batch);
                        self.dispatch_spt(out);
                    }
                    Some(_) => debug!(
                        "[{}/{}] Ignoring dual messages from unknown peer {}",
                        self.node, self.area, sender
                    ),
                    None => debug!(
                        "[{}/{}] Ignoring dual messages from {}, flood optimization disabled",
                        self.node, self.area, sender
                    ),
                }
                PeerMessage::Ack
            }
            PeerMessage::FloodTopoSet(params) => {
                if let Some(spt) = self.spt.as_mut() {
                    spt.set_flood_root_child(&params);
                }
                PeerMessage::Ack
            }
            other => PeerMessage::Error {
                message: format!("Unexpected {} request", other.kind()),
            },
        };
        PeerPacket::new(&self.area, &self.node, reply)
    }

    /// Answer a peer's hash dump with what it is missing and what we want back
    fn sync_response(&mut self, sender: &NodeName, hashes: KeyVals) -> PeerMessage {
        let mut key_vals = KeyVals::new();
        let mut tobe_updated_keys = Vec::new();
        for (key, local) in self.store.dump(&CompiledFilter::default()) {
            match hashes.get(key).map(|remote| compare_for_sync(local, remote)) {
                None | Some(Some(Ordering::Greater)) => {
                    key_vals.insert(key.clone(), local.clone());
                }
                Some(Some(Ordering::Less)) => tobe_updated_keys.push(key.clone()),
                Some(Some(Ordering::Equal)) => {}
                Some(None) => {
                    key_vals.insert(key.clone(), local.clone());
                    tobe_updated_keys.push(key.clone());
                }
            }
        }
        tobe_updated_keys.extend(
            hashes
                .keys()
                .filter(|key| self.store.get(key).is_none())
                .cloned(),
        );
        let key_vals = self.flood.prepare(key_vals);
        debug!(
            "[{}/{}] Sync with {}: sending {} records, requesting {}",
            self.node,
            self.area,
            sender,
            key_vals.len(),
            tobe_updated_keys.len()
        );
        PeerMessage::SyncResponse {
            key_vals,
            tobe_updated_keys,
        }
    }

    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Response {
                peer,
                generation,
                message,
            } => {
                if self.peers.generation(&peer) != Some(generation) {
                    debug!(
                        "[{}/{}] Ignoring {} from stale generation {} of {}",
                        self.node,
                        self.area,
                        message.kind(),
                        generation,
                        peer
                    );
                    return;
                }
                match message {
                    PeerMessage::SyncResponse {
                        key_vals,
                        tobe_updated_keys,
                    } => self.finish_sync(&peer, generation, key_vals, tobe_updated_keys),
                    other => debug!(
                        "[{}/{}] Unexpected {} response from {}",
                        self.node,
                        self.area,
                        other.kind(),
                        peer
                    ),
                }
            }
            PeerEvent::SendFailed {
                peer,
                generation,
                error,
            } => {
                if self.peers.mark_idle(&peer, generation) {
                    warn!(
                        "[{}/{}] Peer {} is unreachable: {}",
                        self.node, self.area, peer, error
                    );
                    self.on_peer_down(&peer);
                }
            }
        }
    }

    fn finish_sync(
        &mut self,
        peer: &NodeName,
        generation: u64,
        key_vals: KeyVals,
        tobe_updated_keys: Vec<String>,
    ) {
        let events = self.merge_from_peer(peer, key_vals);
        self.propagate(events, Some(peer));

        if !tobe_updated_keys.is_empty() {
            let wanted = self.store.get_many(tobe_updated_keys.iter());
            let wanted = self.flood.prepare(wanted);
            if !wanted.is_empty() {
                if let Err(e) = self
                    .peers
                    .send(peer, PeerMessage::FinalizeSync { key_vals: wanted })
                {
                    warn!("[{}/{}] Finalizing sync with {} failed: {}", self.node, self.area, peer, e);
                    self.on_peer_down(peer);
                    return;
                }
            }
        }
        match self.peers.complete_sync(peer, generation) {
            Ok(true) => info!("[{}/{}] Full sync with {} complete", self.node, self.area, peer),
            Ok(false) => {}
            Err(e) => {
                warn!("[{}/{}] Releasing queued floods to {} failed: {}", self.node, self.area, peer, e);
                self.on_peer_down(peer);
            }
        }
    }

    pub fn handle_ttl_tick(&mut self, now: Instant) {
        let tick = self.ttl.tick(&mut self.store, self.node.as_str(), now);
        if !tick.expired.is_empty() {
            debug!(
                "[{}/{}] {} keys expired",
                self.node,
                self.area,
                tick.expired.len()
            );
            self.subs.publish(&tick.expired);
        }
        let refreshed: Vec<StoreEvent> = tick
            .refreshed
            .into_iter()
            .map(|(key, record)| StoreEvent::TtlRefreshed { key, record })
            .collect();
        self.propagate(refreshed, None);

        for (peer, generation) in self.peers.expired_syncs(now) {
            if self.peers.time_out_sync(&peer, generation) {
                warn!("[{}/{}] Full sync with {} timed out", self.node, self.area, peer);
                self.on_peer_down(&peer);
            }
        }
        for (peer, addr) in self.peers.due_retries(now) {
            debug!("[{}/{}] Retrying idle peer {}", self.node, self.area, peer);
            if let Err(e) = self.add_peer(&peer, &addr) {
                warn!("[{}/{}] Retrying peer {} failed: {}", self.node, self.area, peer, e);
            }
        }
        self.subs.purge_closed();
    }

    pub fn handle_flood_tick(&mut self) {
        if let Some(batch) = self.flood.flush() {
            self.flood_to_peers(batch, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::kvstore::filter::KvFilter;
    use crate::kvstore::record::Record;
    use crate::transport::ChannelNetwork;

    fn controller(network: &ChannelNetwork) -> AreaController {
        AreaController::new(
            NodeName::from("node1"),
            &AreaSettings::new("0"),
            &KvStoreSettings::default(),
            Arc::new(network.transport()),
        )
        .unwrap()
    }

    #[derive(Debug)]
    struct NoTransport;

    #[async_trait]
    impl PeerTransport for NoTransport {
        async fn request(&self, addr: &str, _packet: PeerPacket) -> Result<PeerPacket> {
            Err(KvError::PeerUnreachable(addr.to_string()))
        }
    }

    #[tokio::test]
    async fn test_set_local_key_then_read() {
        let mut area = controller(&ChannelNetwork::new());
        let (tx, rx) = oneshot::channel();
        area.handle_command(AreaCommand::SetLocalKey {
            key: "key1".to_string(),
            value: b"v1".to_vec(),
            resp_chan: tx,
        });
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        area.handle_command(AreaCommand::GetKeyVals {
            keys: vec!["key1".to_string(), "missing".to_string()],
            resp_chan: tx,
        });
        let publication = rx.await.unwrap().unwrap();
        assert_eq!(publication.key_vals.len(), 1);
        let record = &publication.key_vals["key1"];
        assert_eq!(record.version, 1);
        assert_eq!(record.originator_id, "node1");
    }

    #[tokio::test]
    async fn test_sync_response_contents() {
        let mut area = controller(&ChannelNetwork::new());
        area.store.merge("ours", Record::new(2, "node1", Some(vec![1]), 10_000));
        area.store.merge("same", Record::new(1, "node1", Some(vec![2]), 10_000));
        area.store.merge("older", Record::new(1, "node1", Some(vec![3]), 10_000));

        let mut hashes = KeyVals::new();
        hashes.insert(
            "same".to_string(),
            Record::new(1, "node1", Some(vec![2]), 10_000).without_value(),
        );
        hashes.insert(
            "older".to_string(),
            Record::new(5, "node2", Some(vec![3]), 10_000).without_value(),
        );
        hashes.insert(
            "theirs".to_string(),
            Record::new(1, "node2", Some(vec![4]), 10_000).without_value(),
        );

        match area.sync_response(&NodeName::from("node2"), hashes) {
            PeerMessage::SyncResponse {
                key_vals,
                mut tobe_updated_keys,
            } => {
                assert_eq!(key_vals.keys().collect::<Vec<_>>(), vec!["ours"]);
                assert_eq!(key_vals["ours"].ttl, 9_999);
                tobe_updated_keys.sort();
                assert_eq!(tobe_updated_keys, vec!["older".to_string(), "theirs".to_string()]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flood_from_peer_merges_and_publishes() {
        let mut area = controller(&ChannelNetwork::new());
        let (tx, rx) = oneshot::channel();
        area.handle_command(AreaCommand::Subscribe {
            filter: KvFilter::default().compile().unwrap(),
            resp_chan: tx,
        });
        let (snapshot, mut updates) = rx.await.unwrap().unwrap();
        assert!(snapshot.key_vals.is_empty());

        let mut key_vals = KeyVals::new();
        key_vals.insert("key1".to_string(), Record::new(1, "node2", Some(vec![1]), 5000));
        let reply = area.handle_peer_packet(PeerPacket::new(
            "0",
            &NodeName::from("node2"),
            PeerMessage::Flood { key_vals: key_vals.clone() },
        ));
        assert_eq!(reply.message, PeerMessage::Ack);
        assert!(updates.try_recv().unwrap().key_vals.contains_key("key1"));

        // A repeat is deduplicated by merge and publishes nothing
        area.handle_peer_packet(PeerPacket::new(
            "0",
            &NodeName::from("node2"),
            PeerMessage::Flood { key_vals },
        ));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spt_commands_need_flood_optimization() {
        let mut area = controller(&ChannelNetwork::new());
        let (tx, rx) = oneshot::channel();
        area.handle_command(AreaCommand::GetSpanningTreeInfo { resp_chan: tx });
        assert!(matches!(rx.await.unwrap(), Err(KvError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unreachable_peer_goes_idle() {
        let mut area = AreaController::new(
            NodeName::from("node1"),
            &AreaSettings::new("0"),
            &KvStoreSettings::default(),
            Arc::new(NoTransport),
        )
        .unwrap();
        let (tx, rx) = oneshot::channel();
        area.handle_command(AreaCommand::AddPeer {
            name: NodeName::from("node2"),
            addr: "nowhere".to_string(),
            resp_chan: tx,
        });
        rx.await.unwrap().unwrap();
        assert_eq!(area.peers.state(&NodeName::from("node2")), Some(SyncState::Syncing));

        let event = area.peer_events_rx.recv().await.unwrap();
        area.handle_peer_event(event);
        assert_eq!(area.peers.state(&NodeName::from("node2")), Some(SyncState::Idle));
    }

    #[tokio::test]
    async fn test_packet_from_idle_peer_restarts_sync() {
        let network = ChannelNetwork::new();
        let mut area = controller(&network);
        let node2 = NodeName::from("node2");
        area.add_peer(&node2, "node2").unwrap();
        let event = area.peer_events_rx.recv().await.unwrap();
        area.handle_peer_event(event);
        assert_eq!(area.peers.state(&node2), Some(SyncState::Idle));

        // node2 comes up later and opens its own sync with us
        let _inbound = network.register("node2").await;
        let reply = area.handle_peer_packet(PeerPacket::new(
            "0",
            &node2,
            PeerMessage::SyncRequest {
                hashes: KeyVals::new(),
            },
        ));
        assert!(matches!(reply.message, PeerMessage::SyncResponse { .. }));
        assert_eq!(area.peers.state(&node2), Some(SyncState::Syncing));

        // Strangers are answered but never adopted as peers
        let stranger = NodeName::from("node9");
        area.handle_peer_packet(PeerPacket::new(
            "0",
            &stranger,
            PeerMessage::Flood {
                key_vals: KeyVals::new(),
            },
        ));
        assert_eq!(area.peers.state(&stranger), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_records_published() {
        let mut area = controller(&ChannelNetwork::new());
        area.store.merge("short", Record::new(1, "node2", Some(vec![1]), 100));
        let (_, mut updates) = area.subs.subscribe(CompiledFilter::default(), &area.store);

        time::advance(Duration::from_millis(150)).await;
        area.handle_ttl_tick(Instant::now());
        let publication = updates.try_recv().unwrap();
        assert_eq!(publication.expired_keys, vec!["short".to_string()]);
        assert!(area.store.is_empty());
    }
}
