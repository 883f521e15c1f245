//! TCP Receiver
//!
//! Accepts peer connections and turns each length-prefixed frame into an
//! `InboundRequest`. A connection may carry any number of request/response
//! exchanges, one at a time.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::messages::PeerPacket;
use super::{InboundRequest, MAX_FRAME_BYTES};
use crate::error::Result;
use crate::transport_error;

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub messages_received: AtomicU64,
    pub receive_errors: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FrozenReceiverStats {
    pub messages_received: u64,
    pub receive_errors: u64,
}

impl ReceiverStats {
    pub fn freeze(&self) -> FrozenReceiverStats {
        FrozenReceiverStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// TCP message receiver
pub struct TcpReceiver {
    pub local_addr: SocketAddr,
    socket: Arc<TcpListener>,
    stats: Arc<ReceiverStats>,
    message_tx: mpsc::Sender<InboundRequest>,
}

impl TcpReceiver {
    /// Bind the listener; nothing is accepted until `start`
    pub async fn new(bind_addr: SocketAddr, message_tx: mpsc::Sender<InboundRequest>) -> Result<Self> {
        let socket = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| transport_error!("Socket creation failed: {}", e))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| transport_error!("Socket creation failed: {}", e))?;

        Ok(Self {
            message_tx,
            local_addr,
            socket: Arc::new(socket),
            stats: Arc::new(ReceiverStats::default()),
        })
    }

    /// Start the accept loop
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let socket = self.socket.clone();
        let stats = self.stats.clone();
        let tx = self.message_tx.clone();

        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match socket.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("TCP accept failed: {}", e);
                        continue;
                    }
                };
                debug!("Accepted peer connection from {}", peer_addr);
                tokio::spawn(serve_connection(stream, peer_addr, tx.clone(), stats.clone()));
            }
        })
    }

    /// Get receiver statistics
    pub fn get_stats(&self) -> FrozenReceiverStats {
        self.stats.freeze()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<InboundRequest>,
    stats: Arc<ReceiverStats>,
) {
    loop {
        // Read length prefix (4 bytes); EOF here is the peer hanging up
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).await.is_err() {
            return;
        }

        let msg_len = u32::from_be_bytes(len_bytes) as usize;
        if msg_len > MAX_FRAME_BYTES {
            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Frame from {} too large: {} bytes", peer_addr, msg_len);
            return;
        }

        let mut buf = vec![0u8; msg_len];
        if let Err(e) = stream.read_exact(&mut buf).await {
            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to read frame from {}: {}", peer_addr, e);
            return;
        }

        let packet = match PeerPacket::deserialize(&buf) {
            Ok(packet) => packet,
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Undecodable frame from {}: {}", peer_addr, e);
                return;
            }
        };
        stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let (response_tx, response_rx) = oneshot::channel();
        if tx.send(InboundRequest { packet, response_tx }).await.is_err() {
            warn!("Inbound handler is gone, closing connection from {}", peer_addr);
            return;
        }

        let response = match response_rx.await {
            Ok(response) => response,
            Err(_) => {
                warn!("Handler dropped response channel for {}", peer_addr);
                return;
            }
        };
        let data = match response.serialize() {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode response for {}: {}", peer_addr, e);
                return;
            }
        };

        let len = data.len() as u32;
        if let Err(e) = stream.write_all(&len.to_be_bytes()).await {
            debug!("Failed to write response length to {}: {}", peer_addr, e);
            return;
        }
        if let Err(e) = stream.write_all(&data).await {
            debug!("Failed to write response to {}: {}", peer_addr, e);
            return;
        }
        if let Err(e) = stream.flush().await {
            debug!("Failed to flush response to {}: {}", peer_addr, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::node::NodeName;
    use crate::transport::messages::PeerMessage;

    #[tokio::test]
    async fn test_receiver_creation() {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let (tx, _rx) = mpsc::channel(1000);
        let receiver = TcpReceiver::new(bind_addr, tx).await.unwrap();

        assert_eq!(receiver.get_stats().messages_received, 0);
        assert_ne!(receiver.local_addr.port(), 0);
    }

    #[tokio::test]
    async fn test_receiver_round_trip() {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = TcpReceiver::new(bind_addr, tx).await.unwrap();
        receiver.start();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let reply = PeerPacket::new(
                    &request.packet.area,
                    &NodeName::from("server"),
                    PeerMessage::Ack,
                );
                let _ = request.response_tx.send(reply);
            }
        });

        let request = PeerPacket::new("0", &NodeName::from("client"), PeerMessage::Ack)
            .serialize()
            .unwrap();
        let mut stream = TcpStream::connect(receiver.local_addr).await.unwrap();
        for _ in 0..2 {
            stream
                .write_all(&(request.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&request).await.unwrap();

            let mut len_bytes = [0u8; 4];
            timeout(Duration::from_secs(2), stream.read_exact(&mut len_bytes))
                .await
                .unwrap()
                .unwrap();
            let mut buf = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let response = PeerPacket::deserialize(&buf).unwrap();
            assert_eq!(response.sender.as_str(), "server");
            assert_eq!(response.message, PeerMessage::Ack);
        }

        assert_eq!(receiver.get_stats().messages_received, 2);
    }
}
