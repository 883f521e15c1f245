//! Per-peer outbox task
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::PeerEvent;
use crate::node::NodeName;
use crate::transport::{PeerMessage, PeerPacket, PeerTransport};

pub(crate) struct Outbox {
    pub area: String,
    pub node: NodeName,
    pub peer: NodeName,
    pub addr: String,
    pub generation: u64,
    pub transport: Arc<dyn PeerTransport>,
    pub events_tx: mpsc::Sender<PeerEvent>,
}

impl Outbox {
    /// Send queued messages one at a time until the queue closes or a send
    /// fails. A failure is reported once and ends the task.
    pub async fn run(self, mut rx: mpsc::Receiver<PeerMessage>) {
        while let Some(message) = rx.recv().await {
            let kind = message.kind();
            let packet = PeerPacket::new(&self.area, &self.node, message);
            match self.transport.request(&self.addr, packet).await {
                Ok(response) => match response.message {
                    PeerMessage::Ack => {}
                    PeerMessage::Error { message } => {
                        warn!(
                            "[{}/{}] Peer {} rejected {}: {}",
                            self.node, self.area, self.peer, kind, message
                        );
                    }
                    message => {
                        let event = PeerEvent::Response {
                            peer: self.peer.clone(),
                            generation: self.generation,
                            message,
                        };
                        if self.events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!(
                        "[{}/{}] Sending {} to {} failed: {}",
                        self.node, self.area, kind, self.peer, e
                    );
                    let _ = self
                        .events_tx
                        .send(PeerEvent::SendFailed {
                            peer: self.peer.clone(),
                            generation: self.generation,
                            error: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
        debug!(
            "[{}/{}] Outbox for {} (generation {}) closed",
            self.node, self.area, self.peer, self.generation
        );
    }
}
