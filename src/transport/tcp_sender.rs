//! TCP Transport
//!
//! Pools TCP connections per peer address for request/response exchanges.
//! Peers are added on first use since the peer set changes at runtime.
//! At most `max_connections_per_peer` idle connections are kept per peer.
//! A connection that fails or times out mid-exchange is dropped, never
//! returned to the pool.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::debug;

use super::messages::PeerPacket;
use super::{PeerTransport, MAX_FRAME_BYTES};
use crate::error::{KvError, Result};
use crate::node::NodeName;

/// TCP connection with metadata
#[derive(Debug)]
struct TcpConnection {
    stream: TcpStream,
    last_used: std::time::Instant,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            last_used: std::time::Instant::now(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

#[derive(Debug, Default)]
pub struct TcpTransportStats {
    pub peer_count: AtomicUsize,
    pub total_connections: AtomicUsize,
    pub active_connections: AtomicUsize,
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub connection_errors: AtomicU64,
    pub timeout_errors: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FrozenTcpTransportStats {
    pub peer_count: usize,
    pub total_connections: usize,
    pub active_connections: usize,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
}

impl TcpTransportStats {
    pub fn freeze(&self) -> FrozenTcpTransportStats {
        FrozenTcpTransportStats {
            peer_count: self.peer_count.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
        }
    }
}

type ConnectionPool = Arc<Mutex<Vec<TcpConnection>>>;

/// Pooled TCP request/response transport
#[derive(Debug)]
pub struct TcpTransport {
    node_name: NodeName,
    peer_connections: RwLock<IndexMap<SocketAddr, ConnectionPool>>,
    max_connections_per_peer: usize,
    connect_timeout: Duration,
    request_timeout: Duration,
    idle_timeout: Duration,
    stats: Arc<TcpTransportStats>,
}

impl TcpTransport {
    pub fn new(node_name: NodeName, request_timeout: Duration, max_connections_per_peer: usize) -> Self {
        Self {
            node_name,
            peer_connections: RwLock::new(IndexMap::new()),
            max_connections_per_peer,
            connect_timeout: Duration::from_millis(1000),
            request_timeout,
            idle_timeout: Duration::from_secs(60),
            stats: Arc::new(TcpTransportStats::default()),
        }
    }

    pub fn get_stats(&self) -> FrozenTcpTransportStats {
        self.stats.freeze()
    }

    async fn resolve(addr: &str) -> Result<SocketAddr> {
        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            return Ok(socket_addr);
        }
        tokio::net::lookup_host(addr)
            .await
            .map_err(|e| KvError::PeerUnreachable(format!("Cannot resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| KvError::PeerUnreachable(format!("No address for {}", addr)))
    }

    async fn pool_for(&self, target: SocketAddr) -> ConnectionPool {
        if let Some(pool) = self.peer_connections.read().await.get(&target) {
            return pool.clone();
        }
        let mut peers = self.peer_connections.write().await;
        peers
            .entry(target)
            .or_insert_with(|| {
                self.stats.peer_count.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] Added TCP peer: {}", self.node_name, target);
                Arc::new(Mutex::new(Vec::new()))
            })
            .clone()
    }

    /// Get a connection from the pool or create a new one
    async fn get_or_create_connection(&self, target: SocketAddr) -> Result<TcpConnection> {
        let pool = self.pool_for(target).await;
        let mut connections = pool.lock().await;

        // Clean up expired connections
        let before = connections.len();
        connections.retain(|conn| !conn.is_expired(self.idle_timeout));
        let removed = before - connections.len();
        if removed > 0 {
            self.stats
                .total_connections
                .fetch_sub(removed, Ordering::Relaxed);
        }

        if let Some(mut conn) = connections.pop() {
            conn.last_used = std::time::Instant::now();
            self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
            return Ok(conn);
        }

        drop(connections);

        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                debug!("[{}] Created new TCP connection to {}", self.node_name, target);
                self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                Ok(TcpConnection::new(stream))
            }
            Ok(Err(e)) => {
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                Err(KvError::PeerUnreachable(format!(
                    "Failed to connect to {}: {}",
                    target, e
                )))
            }
            Err(_) => {
                self.stats.timeout_errors.fetch_add(1, Ordering::Relaxed);
                Err(KvError::PeerUnreachable(format!(
                    "Connection timeout to {}",
                    target
                )))
            }
        }
    }

    /// Return a connection to the pool
    async fn return_connection(&self, target: SocketAddr, mut connection: TcpConnection) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        connection.last_used = std::time::Instant::now();
        let pool = self.pool_for(target).await;
        let mut connections = pool.lock().await;
        if connections.len() < self.max_connections_per_peer {
            connections.push(connection);
        } else {
            self.stats.total_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn discard_connection(&self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.stats.total_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn exchange(&self, connection: &mut TcpConnection, request: &[u8]) -> Result<Vec<u8>> {
        let request_len = request.len() as u32;
        connection.stream.write_all(&request_len.to_be_bytes()).await?;
        connection.stream.write_all(request).await?;
        connection.stream.flush().await?;

        let mut len_bytes = [0u8; 4];
        connection
            .stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| KvError::Transport(format!("Failed to read response length: {}", e)))?;

        let response_len = u32::from_be_bytes(len_bytes) as usize;
        if response_len > MAX_FRAME_BYTES {
            return Err(KvError::Transport("Response too large".to_string()));
        }

        let mut response = vec![0u8; response_len];
        connection
            .stream
            .read_exact(&mut response)
            .await
            .map_err(|e| KvError::Transport(format!("Failed to read response data: {}", e)))?;
        Ok(response)
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn request(&self, addr: &str, packet: PeerPacket) -> Result<PeerPacket> {
        let target = Self::resolve(addr).await?;
        let request = packet.serialize()?;
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        let mut connection = self.get_or_create_connection(target).await?;
        let response = match timeout(self.request_timeout, self.exchange(&mut connection, &request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.discard_connection();
                return Err(e);
            }
            Err(_) => {
                self.discard_connection();
                self.stats.timeout_errors.fetch_add(1, Ordering::Relaxed);
                return Err(KvError::SyncTimeout(format!(
                    "No response from {} within {:?}",
                    target, self.request_timeout
                )));
            }
        };
        self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
        self.return_connection(target, connection).await;

        PeerPacket::deserialize(&response)
    }
}
