//! Peer Manager
//!
//! Tracks the peers of one area, their sync state and their outboxes. Each
//! peer owns a bounded outbox drained by its own task, so the area actor
//! never waits on the network.
pub mod manager;
pub mod outbox;

use serde::{Deserialize, Serialize};

use crate::node::NodeName;
use crate::transport::PeerMessage;
pub use manager::PeerManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Down or failed; floods are dropped until the peer is retried, added
    /// again, or heard from
    Idle,
    /// Full sync in flight; floods are queued
    Syncing,
    Synced,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Synced => write!(f, "synced"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCounters {
    pub messages_sent: u64,
    pub floods_sent: u64,
    pub floods_queued: u64,
    pub floods_dropped: u64,
    pub syncs_started: u64,
    pub syncs_completed: u64,
    /// Full syncs abandoned at their deadline
    pub sync_timeouts: u64,
    pub failures: u64,
}

/// Peer as reported by `get_peers`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: NodeName,
    pub addr: String,
    pub state: SyncState,
    pub queued_keys: usize,
    pub counters: PeerCounters,
}

/// Outcomes of outbox sends, reported back to the area actor.
///
/// `generation` identifies the peer incarnation that sent the request, so
/// results from before a re-add or delete are ignored.
#[derive(Debug)]
pub enum PeerEvent {
    Response {
        peer: NodeName,
        generation: u64,
        message: PeerMessage,
    },
    SendFailed {
        peer: NodeName,
        generation: u64,
        error: String,
    },
}
