use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::outbox::Outbox;
use super::{PeerCounters, PeerEvent, PeerInfo, SyncState};
use crate::error::{KvError, Result};
use crate::kvstore::record::{fold_pending, KeyVals};
use crate::node::NodeName;
use crate::settings::KvStoreSettings;
use crate::transport::{PeerMessage, PeerTransport};

#[derive(Debug)]
struct Peer {
    addr: String,
    state: SyncState,
    outbox: Option<mpsc::Sender<PeerMessage>>,
    task: Option<JoinHandle<()>>,
    /// Floods held back while the peer is syncing
    queued: KeyVals,
    sync_deadline: Option<Instant>,
    /// Next reconnect attempt while idle
    retry_at: Option<Instant>,
    retry_backoff: Duration,
    retries_left: u32,
    generation: u64,
    counters: PeerCounters,
}

impl Peer {
    fn shut_down(&mut self) {
        self.outbox = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.queued.clear();
        self.sync_deadline = None;
        self.retry_at = None;
        self.state = SyncState::Idle;
    }

    /// Shut down and schedule a retry while any are left, backing off on
    /// repeated failures
    fn go_idle(&mut self, retry_max: Duration) {
        self.shut_down();
        if self.retries_left == 0 {
            return;
        }
        self.retries_left -= 1;
        self.retry_at = Some(Instant::now() + self.retry_backoff);
        self.retry_backoff = (self.retry_backoff * 2).min(retry_max);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub struct PeerManager {
    area: String,
    node: NodeName,
    transport: Arc<dyn PeerTransport>,
    events_tx: mpsc::Sender<PeerEvent>,
    peer_queue_size: usize,
    sync_timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
    retry_limit: u32,
    peers: IndexMap<NodeName, Peer>,
    next_generation: u64,
}

impl PeerManager {
    pub fn new(
        area: &str,
        node: NodeName,
        transport: Arc<dyn PeerTransport>,
        events_tx: mpsc::Sender<PeerEvent>,
        settings: &KvStoreSettings,
    ) -> Self {
        Self {
            area: area.to_string(),
            node,
            transport,
            events_tx,
            peer_queue_size: settings.peer_queue_size,
            sync_timeout: Duration::from_millis(settings.sync_timeout_ms),
            retry_initial: Duration::from_millis(settings.peer_retry_ms),
            retry_max: Duration::from_millis(settings.peer_retry_max_ms),
            retry_limit: settings.peer_retry_limit,
            peers: IndexMap::new(),
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, name: &NodeName) -> bool {
        self.peers.contains_key(name)
    }

    pub fn state(&self, name: &NodeName) -> Option<SyncState> {
        self.peers.get(name).map(|p| p.state)
    }

    pub fn generation(&self, name: &NodeName) -> Option<u64> {
        self.peers.get(name).map(|p| p.generation)
    }

    /// Address of a configured peer that is currently idle
    pub fn idle_addr(&self, name: &NodeName) -> Option<String> {
        self.peers
            .get(name)
            .filter(|p| p.state == SyncState::Idle)
            .map(|p| p.addr.clone())
    }

    /// Idle peers whose retry time has come, with their addresses
    pub fn due_retries(&self, now: Instant) -> Vec<(NodeName, String)> {
        self.peers
            .iter()
            .filter(|(_, p)| {
                p.state == SyncState::Idle && p.retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|(name, p)| (name.clone(), p.addr.clone()))
            .collect()
    }

    /// Peers that can take floods, synced or not
    pub fn active_peers(&self) -> impl Iterator<Item = &NodeName> + '_ {
        self.peers
            .iter()
            .filter(|(_, p)| p.state != SyncState::Idle)
            .map(|(name, _)| name)
    }

    /// Create a peer, or restart an idle one, in `Syncing` with a fresh outbox.
    ///
    /// Returns `false` when the peer is already up at the same address; the
    /// caller starts a full sync only on `true`.
    pub fn add_peer(&mut self, name: &NodeName, addr: &str) -> Result<bool> {
        if name == &self.node {
            return Err(KvError::Validation(format!(
                "Node {} cannot peer with itself",
                name
            )));
        }
        if addr.is_empty() {
            return Err(KvError::Validation(format!("Peer {} has no address", name)));
        }
        if let Some(existing) = self.peers.get(name) {
            if existing.state != SyncState::Idle && existing.addr == addr {
                debug!("[{}/{}] Peer {} already up", self.node, self.area, name);
                return Ok(false);
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let (tx, rx) = mpsc::channel(self.peer_queue_size);
        let outbox = Outbox {
            area: self.area.clone(),
            node: self.node.clone(),
            peer: name.clone(),
            addr: addr.to_string(),
            generation,
            transport: self.transport.clone(),
            events_tx: self.events_tx.clone(),
        };
        let task = tokio::spawn(outbox.run(rx));

        let peer = self.peers.entry(name.clone()).or_insert_with(|| Peer {
            addr: addr.to_string(),
            state: SyncState::Idle,
            outbox: None,
            task: None,
            queued: KeyVals::new(),
            sync_deadline: None,
            retry_at: None,
            retry_backoff: self.retry_initial,
            retries_left: self.retry_limit,
            generation,
            counters: PeerCounters::default(),
        });
        peer.shut_down();
        peer.addr = addr.to_string();
        peer.outbox = Some(tx);
        peer.task = Some(task);
        peer.generation = generation;
        peer.state = SyncState::Syncing;
        peer.sync_deadline = Some(Instant::now() + self.sync_timeout);
        peer.counters.syncs_started += 1;

        info!(
            "[{}/{}] Added peer {} at {} (generation {})",
            self.node, self.area, name, addr, generation
        );
        Ok(true)
    }

    pub fn del_peer(&mut self, name: &NodeName) -> bool {
        match self.peers.shift_remove(name) {
            Some(_) => {
                info!("[{}/{}] Deleted peer {}", self.node, self.area, name);
                true
            }
            None => false,
        }
    }

    /// Queue `message` on the peer's outbox regardless of sync state.
    ///
    /// An error means the peer was unusable and is now `Idle`.
    pub fn send(&mut self, name: &NodeName, message: PeerMessage) -> Result<()> {
        let Some(peer) = self.peers.get_mut(name) else {
            return Err(KvError::Validation(format!("Unknown peer {}", name)));
        };
        let Some(outbox) = peer.outbox.as_ref() else {
            return Err(KvError::PeerUnreachable(format!("Peer {} is idle", name)));
        };
        match outbox.try_send(message) {
            Ok(()) => {
                peer.counters.messages_sent += 1;
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "outbox full",
                    TrySendError::Closed(_) => "outbox closed",
                };
                warn!(
                    "[{}/{}] Peer {} {}, moving to idle",
                    self.node, self.area, name, reason
                );
                peer.counters.failures += 1;
                peer.go_idle(self.retry_max);
                Err(KvError::PeerUnreachable(format!("Peer {} {}", name, reason)))
            }
        }
    }

    /// Flood `key_vals` to one peer according to its sync state
    pub fn enqueue_flood(&mut self, name: &NodeName, key_vals: &KeyVals) -> Result<()> {
        let Some(peer) = self.peers.get_mut(name) else {
            return Ok(());
        };
        match peer.state {
            SyncState::Idle => {
                peer.counters.floods_dropped += 1;
                Ok(())
            }
            SyncState::Syncing => {
                peer.counters.floods_queued += 1;
                for (key, record) in key_vals.iter() {
                    fold_pending(&mut peer.queued, key.clone(), record.clone());
                }
                Ok(())
            }
            SyncState::Synced => {
                peer.counters.floods_sent += 1;
                self.send(
                    name,
                    PeerMessage::Flood {
                        key_vals: key_vals.clone(),
                    },
                )
            }
        }
    }

    /// Move a syncing peer to `Synced` and release the floods it missed
    pub fn complete_sync(&mut self, name: &NodeName, generation: u64) -> Result<bool> {
        let Some(peer) = self.peers.get_mut(name) else {
            return Ok(false);
        };
        if peer.generation != generation || peer.state != SyncState::Syncing {
            return Ok(false);
        }
        peer.state = SyncState::Synced;
        peer.sync_deadline = None;
        peer.retry_backoff = self.retry_initial;
        peer.retries_left = self.retry_limit;
        peer.counters.syncs_completed += 1;
        let queued = std::mem::take(&mut peer.queued);
        info!(
            "[{}/{}] Peer {} synced, releasing {} queued keys",
            self.node,
            self.area,
            name,
            queued.len()
        );
        if !queued.is_empty() {
            self.send(name, PeerMessage::Flood { key_vals: queued })?;
        }
        Ok(true)
    }

    /// Drop a peer incarnation to `Idle`. Returns `true` when the state changed.
    pub fn mark_idle(&mut self, name: &NodeName, generation: u64) -> bool {
        match self.peers.get_mut(name) {
            Some(peer) if peer.generation == generation && peer.state != SyncState::Idle => {
                peer.counters.failures += 1;
                peer.go_idle(self.retry_max);
                info!("[{}/{}] Peer {} is idle", self.node, self.area, name);
                true
            }
            _ => false,
        }
    }

    /// Give up on a full sync that ran past its deadline
    pub fn time_out_sync(&mut self, name: &NodeName, generation: u64) -> bool {
        match self.peers.get_mut(name) {
            Some(peer) if peer.generation == generation && peer.state == SyncState::Syncing => {
                peer.counters.sync_timeouts += 1;
                peer.go_idle(self.retry_max);
                true
            }
            _ => false,
        }
    }

    /// Syncing peers whose deadline passed, with the generation that timed out
    pub fn expired_syncs(&self, now: Instant) -> Vec<(NodeName, u64)> {
        self.peers
            .iter()
            .filter(|(_, p)| {
                p.state == SyncState::Syncing && p.sync_deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|(name, p)| (name.clone(), p.generation))
            .collect()
    }

    pub fn get_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(name, peer)| PeerInfo {
                name: name.clone(),
                addr: peer.addr.clone(),
                state: peer.state,
                queued_keys: peer.queued.len(),
                counters: peer.counters.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::kvstore::record::Record;
    use crate::transport::PeerPacket;

    /// Transport that answers every request with an ack after a short pause
    #[derive(Debug)]
    struct SlowAck;

    #[async_trait]
    impl PeerTransport for SlowAck {
        async fn request(&self, _addr: &str, packet: PeerPacket) -> Result<PeerPacket> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(PeerPacket::new(&packet.area, &NodeName::from("peer"), PeerMessage::Ack))
        }
    }

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl PeerTransport for Unreachable {
        async fn request(&self, addr: &str, _packet: PeerPacket) -> Result<PeerPacket> {
            Err(KvError::PeerUnreachable(addr.to_string()))
        }
    }

    fn manager(transport: Arc<dyn PeerTransport>, queue: usize) -> (PeerManager, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let settings = KvStoreSettings {
            peer_queue_size: queue,
            sync_timeout_ms: 500,
            peer_retry_ms: 100,
            peer_retry_max_ms: 400,
            peer_retry_limit: 3,
            ..KvStoreSettings::default()
        };
        let manager = PeerManager::new("0", NodeName::from("node1"), transport, tx, &settings);
        (manager, rx)
    }

    fn flood() -> KeyVals {
        let mut key_vals = KeyVals::new();
        key_vals.insert("k".to_string(), Record::new(1, "node1", Some(vec![1]), 1000));
        key_vals
    }

    #[tokio::test]
    async fn test_add_peer_starts_syncing() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        assert!(peers.add_peer(&b, "node2").unwrap());
        assert_eq!(peers.state(&b), Some(SyncState::Syncing));
        assert!(!peers.add_peer(&b, "node2").unwrap());
        assert!(peers.add_peer(&NodeName::from("node1"), "self").is_err());
    }

    #[tokio::test]
    async fn test_floods_queue_while_syncing() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        peers.enqueue_flood(&b, &flood()).unwrap();
        assert_eq!(peers.get_peers()[0].queued_keys, 1);

        let generation = peers.generation(&b).unwrap();
        assert!(peers.complete_sync(&b, generation).unwrap());
        let info = &peers.get_peers()[0];
        assert_eq!(info.state, SyncState::Synced);
        assert_eq!(info.queued_keys, 0);
        assert_eq!(info.counters.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_queued_refresh_keeps_pending_value() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();

        let update = Record::new(2, "node1", Some(vec![9]), 1000);
        let mut key_vals = KeyVals::new();
        key_vals.insert("k".to_string(), update.clone());
        peers.enqueue_flood(&b, &key_vals).unwrap();

        key_vals.insert("k".to_string(), update.without_value().with_ttl_version(1));
        peers.enqueue_flood(&b, &key_vals).unwrap();

        let queued = &peers.peers[&b].queued["k"];
        assert_eq!(queued.value, Some(vec![9]));
        assert_eq!(queued.version, 2);
        assert_eq!(queued.ttl_version, 1);
    }

    #[tokio::test]
    async fn test_full_outbox_moves_peer_to_idle() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 1);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        let generation = peers.generation(&b).unwrap();
        peers.complete_sync(&b, generation).unwrap();

        // The first message is picked up by the task, the next fills the queue
        let mut failed = false;
        for _ in 0..4 {
            if peers.enqueue_flood(&b, &flood()).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert_eq!(peers.state(&b), Some(SyncState::Idle));
        // Idle peers drop floods silently
        assert!(peers.enqueue_flood(&b, &flood()).is_ok());
    }

    #[tokio::test]
    async fn test_send_failure_reported_with_generation() {
        let (mut peers, mut rx) = manager(Arc::new(Unreachable), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        peers
            .send(&b, PeerMessage::SyncRequest { hashes: KeyVals::new() })
            .unwrap();

        match rx.recv().await.unwrap() {
            PeerEvent::SendFailed { peer, generation, .. } => {
                assert_eq!(peer, b);
                assert!(peers.mark_idle(&peer, generation));
                assert!(!peers.mark_idle(&peer, generation));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_deadline() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        assert!(peers.expired_syncs(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(600)).await;
        let expired = peers.expired_syncs(Instant::now());
        assert_eq!(expired, vec![(b.clone(), 1)]);

        assert!(peers.time_out_sync(&b, 1));
        assert!(!peers.time_out_sync(&b, 1));
        let info = &peers.get_peers()[0];
        assert_eq!(info.state, SyncState::Idle);
        assert_eq!(info.counters.sync_timeouts, 1);
        assert_eq!(info.counters.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_retried_with_backoff() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        assert!(peers.mark_idle(&b, 1));
        assert_eq!(peers.idle_addr(&b), Some("node2".to_string()));
        assert!(peers.due_retries(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(
            peers.due_retries(Instant::now()),
            vec![(b.clone(), "node2".to_string())]
        );

        // A second failure waits twice as long
        assert!(peers.add_peer(&b, "node2").unwrap());
        assert!(peers.idle_addr(&b).is_none());
        assert!(peers.due_retries(Instant::now()).is_empty());
        assert!(peers.mark_idle(&b, 2));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(peers.due_retries(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(peers.due_retries(Instant::now()).len(), 1);

        // A completed sync resets the backoff
        peers.add_peer(&b, "node2").unwrap();
        assert!(peers.complete_sync(&b, 3).unwrap());
        assert!(peers.due_retries(Instant::now()).is_empty());
        assert!(peers.mark_idle(&b, 3));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(peers.due_retries(Instant::now()).len(), 1);

        peers.del_peer(&b);
        assert!(peers.due_retries(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_retries_are_bounded() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        for generation in 1..=3 {
            assert!(peers.mark_idle(&b, generation));
            tokio::time::advance(Duration::from_millis(400)).await;
            assert_eq!(peers.due_retries(Instant::now()).len(), 1);
            peers.add_peer(&b, "node2").unwrap();
        }

        // Out of retries: the peer waits for contact or a new add_peer
        assert!(peers.mark_idle(&b, 4));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(peers.due_retries(Instant::now()).is_empty());
        assert_eq!(peers.idle_addr(&b), Some("node2".to_string()));
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let (mut peers, _rx) = manager(Arc::new(SlowAck), 8);
        let b = NodeName::from("node2");
        peers.add_peer(&b, "node2").unwrap();
        peers.del_peer(&b);
        peers.add_peer(&b, "node2").unwrap();
        assert!(!peers.complete_sync(&b, 1).unwrap());
        assert!(peers.complete_sync(&b, 2).unwrap());
    }
}
