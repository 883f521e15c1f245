//! Peer Wire Protocol
//!
//! Every exchange between two nodes is one `PeerPacket` request answered by
//! exactly one `PeerPacket` response. Packets are bincode-encoded for the
//! wire; the HTTP API uses serde_json for the same payload types.
use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::error::Result;
use crate::flood::dual::{DualMessages, FloodTopoSetParams};
use crate::kvstore::record::KeyVals;
use crate::node::NodeName;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum PeerMessage {
    /// Incremental update of accepted records
    Flood { key_vals: KeyVals },

    /// First step of full sync: the sender's records with values cleared
    SyncRequest { hashes: KeyVals },

    /// Records where the responder is better or the requester lacks the key,
    /// plus the keys the responder wants back
    SyncResponse {
        key_vals: KeyVals,
        tobe_updated_keys: Vec<String>,
    },

    /// Last step of full sync: the records the responder asked for
    FinalizeSync { key_vals: KeyVals },

    /// Spanning-tree convergence messages
    Dual(DualMessages),

    /// Child registration with a spanning-tree parent
    FloodTopoSet(FloodTopoSetParams),

    Ack,

    Error { message: String },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Flood { .. } => "flood",
            PeerMessage::SyncRequest { .. } => "sync_request",
            PeerMessage::SyncResponse { .. } => "sync_response",
            PeerMessage::FinalizeSync { .. } => "finalize_sync",
            PeerMessage::Dual(_) => "dual",
            PeerMessage::FloodTopoSet(_) => "flood_topo_set",
            PeerMessage::Ack => "ack",
            PeerMessage::Error { .. } => "error",
        }
    }
}

/// PeerPacket wraps messages for network transmission
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PeerPacket {
    pub area: String,
    pub sender: NodeName,
    pub message: PeerMessage,
}

impl PeerPacket {
    pub fn new(area: &str, sender: &NodeName, message: PeerMessage) -> Self {
        Self {
            area: area.to_string(),
            sender: sender.clone(),
            message,
        }
    }

    pub fn error(area: &str, sender: &NodeName, message: String) -> Self {
        Self::new(area, sender, PeerMessage::Error { message })
    }

    pub fn serialize(&self) -> Result<Bytes> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config).map(Bytes::from)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard().with_big_endian();
        let (result, _) = bincode::decode_from_slice(data, config)?;
        Ok(result)
    }
}
