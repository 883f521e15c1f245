/// Area commands are the only way into an area actor.
use tokio::sync::{broadcast, oneshot};

use super::messages::{AreaSummary, MergeSummary};
use crate::error::Result;
use crate::flood::dual::{DualMessages, FloodTopoSetParams};
use crate::flood::spt::SptInfos;
use crate::kvstore::filter::CompiledFilter;
use crate::kvstore::record::{KeyVals, Publication};
use crate::node::NodeName;
use crate::peers::PeerInfo;
use crate::transport::PeerPacket;

#[derive(Debug)]
pub enum AreaCommand {
    /// Read specific keys
    GetKeyVals {
        keys: Vec<String>,
        resp_chan: oneshot::Sender<Result<Publication>>,
    },
    /// Read every record matching a filter
    GetKeyValsFiltered {
        filter: CompiledFilter,
        resp_chan: oneshot::Sender<Result<Publication>>,
    },
    /// Same as `GetKeyValsFiltered` with values cleared
    GetHashesFiltered {
        filter: CompiledFilter,
        resp_chan: oneshot::Sender<Result<Publication>>,
    },
    /// Merge externally published records and flood the accepted ones
    SetKeyVals {
        key_vals: KeyVals,
        resp_chan: oneshot::Sender<Result<MergeSummary>>,
    },
    /// Originate a record owned by this node and keep it alive
    SetLocalKey {
        key: String,
        value: Vec<u8>,
        resp_chan: oneshot::Sender<Result<()>>,
    },
    /// Stop refreshing a local record
    UnsetLocalKey {
        key: String,
        resp_chan: oneshot::Sender<Result<bool>>,
    },
    Subscribe {
        filter: CompiledFilter,
        resp_chan: oneshot::Sender<Result<(Publication, broadcast::Receiver<Publication>)>>,
    },
    Summary {
        resp_chan: oneshot::Sender<Result<AreaSummary>>,
    },
    AddPeer {
        name: NodeName,
        addr: String,
        resp_chan: oneshot::Sender<Result<()>>,
    },
    DelPeer {
        name: NodeName,
        resp_chan: oneshot::Sender<Result<bool>>,
    },
    GetPeers {
        resp_chan: oneshot::Sender<Result<Vec<PeerInfo>>>,
    },
    /// Dual messages delivered through the RPC surface
    ProcessFloodMessage {
        messages: DualMessages,
        resp_chan: oneshot::Sender<Result<()>>,
    },
    SetFloodRootChild {
        params: FloodTopoSetParams,
        resp_chan: oneshot::Sender<Result<()>>,
    },
    GetSpanningTreeInfo {
        resp_chan: oneshot::Sender<Result<SptInfos>>,
    },
    /// A request from a peer; always answered with exactly one packet
    PeerPacket {
        packet: PeerPacket,
        resp_chan: oneshot::Sender<PeerPacket>,
    },
}
