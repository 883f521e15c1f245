//! Peer Transport
//!
//! Request/response delivery of `PeerPacket`s between nodes. A TCP transport
//! carries length-prefixed bincode frames; an in-memory channel transport
//! wires nodes together inside one process for tests and simulations.
pub mod channel;
pub mod messages;
pub mod tcp_receiver;
pub mod tcp_sender;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;
pub use channel::{ChannelNetwork, ChannelTransport};
pub use messages::{PeerMessage, PeerPacket};
pub use tcp_receiver::TcpReceiver;
pub use tcp_sender::TcpTransport;

/// Largest frame either side accepts
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Trait for sending requests to peers
#[async_trait]
pub trait PeerTransport: Send + Sync + std::fmt::Debug {
    /// Send `packet` to the peer at `addr` and wait for its response
    async fn request(&self, addr: &str, packet: PeerPacket) -> Result<PeerPacket>;
}

/// A packet received from a peer, with the channel its response goes back on
#[derive(Debug)]
pub struct InboundRequest {
    pub packet: PeerPacket,
    pub response_tx: oneshot::Sender<PeerPacket>,
}
