//! In-memory transport
//!
//! A shared `ChannelNetwork` broker routes requests between nodes living in
//! the same process. Packets still go through the wire codec so a channel
//! run exercises the same encoding as TCP.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::messages::PeerPacket;
use super::{InboundRequest, PeerTransport};
use crate::error::{KvError, Result};

const INBOUND_QUEUE_SIZE: usize = 256;

/// Shared network broker, keyed by the address a node registered under
#[derive(Clone, Debug, Default)]
pub struct ChannelNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::Sender<InboundRequest>>>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node at `addr`; requests for it arrive on the returned receiver
    pub async fn register(&self, addr: &str) -> mpsc::Receiver<InboundRequest> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        self.peers.lock().await.insert(addr.to_string(), tx);
        rx
    }

    /// Detach `addr`; later requests to it fail as unreachable
    pub async fn unregister(&self, addr: &str) -> bool {
        self.peers.lock().await.remove(addr).is_some()
    }

    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport {
            network: self.clone(),
        }
    }
}

/// Client side of a `ChannelNetwork`
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    network: ChannelNetwork,
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn request(&self, addr: &str, packet: PeerPacket) -> Result<PeerPacket> {
        let peers = self.network.peers.lock().await;
        let inbound = peers
            .get(addr)
            .ok_or_else(|| KvError::PeerUnreachable(format!("Peer {} not found in network", addr)))?
            .clone();
        drop(peers);

        let packet = PeerPacket::deserialize(&packet.serialize()?)?;
        let (response_tx, response_rx) = oneshot::channel();
        inbound
            .send(InboundRequest {
                packet,
                response_tx,
            })
            .await
            .map_err(|_| KvError::PeerUnreachable(format!("Peer {} inbound channel closed", addr)))?;

        let response = response_rx
            .await
            .map_err(|_| KvError::PeerUnreachable(format!("Peer {} dropped the request", addr)))?;
        PeerPacket::deserialize(&response.serialize()?)
    }
}
