//! KvNode: routes RPC calls and peer traffic to the right area actor
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::area::AreaController;
use super::commands::AreaCommand;
use super::messages::{AreaSummary, MergeSummary};
use super::NodeName;
use crate::error::{KvError, Result};
use crate::flood::dual::{DualMessages, FloodTopoSetParams};
use crate::flood::spt::SptInfos;
use crate::kvstore::filter::KvFilter;
use crate::kvstore::record::{KeyVals, Publication};
use crate::peers::PeerInfo;
use crate::settings::Settings;
use crate::subscription::{merge_receivers, PublicationStream};
use crate::transport::{InboundRequest, PeerPacket, PeerTransport};
use crate::validation_error;

/// Handle to a running node. Cheap to clone; every clone talks to the same
/// area actors.
#[derive(Clone, Debug)]
pub struct KvNode {
    node_name: NodeName,
    areas: Arc<BTreeMap<String, mpsc::Sender<AreaCommand>>>,
}

impl KvNode {
    /// Spawn one actor per configured area and add the static peers
    pub async fn start(settings: &Settings, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        settings.validate()?;
        let node_name = settings.node_name.clone();

        let mut areas = BTreeMap::new();
        for area_settings in settings.areas.iter() {
            let controller = AreaController::new(
                node_name.clone(),
                area_settings,
                &settings.kvstore,
                transport.clone(),
            )?;
            let (tx, rx) = mpsc::channel(settings.kvstore.command_queue_size);
            tokio::spawn(controller.start(rx));
            areas.insert(area_settings.area_id.clone(), tx);
        }
        info!(
            "[{}] Started {} areas: {:?}",
            node_name,
            areas.len(),
            areas.keys().collect::<Vec<_>>()
        );

        let node = Self {
            node_name,
            areas: Arc::new(areas),
        };
        for area_settings in settings.areas.iter() {
            for peer in area_settings.peers.iter() {
                node.add_peer(&area_settings.area_id, peer.name.clone(), &peer.addr)
                    .await?;
            }
        }
        Ok(node)
    }

    pub fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    pub fn area_ids(&self) -> Vec<String> {
        self.areas.keys().cloned().collect()
    }

    fn area(&self, area: &str) -> Result<&mpsc::Sender<AreaCommand>> {
        self.areas
            .get(area)
            .ok_or_else(|| validation_error!("Unknown area: {}", area))
    }

    async fn request<T>(
        &self,
        area: &str,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> AreaCommand,
    ) -> Result<T> {
        let tx = self.area(area)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(make(resp_tx))
            .await
            .map_err(|e| KvError::Concurrency(format!("Area {} is gone: {}", area, e)))?;
        resp_rx
            .await
            .map_err(|e| KvError::Concurrency(format!("Area {} dropped the request: {}", area, e)))?
    }

    pub async fn get_key_vals(&self, area: &str, keys: Vec<String>) -> Result<Publication> {
        self.request(area, |resp_chan| AreaCommand::GetKeyVals { keys, resp_chan })
            .await
    }

    pub async fn get_key_vals_filtered(&self, area: &str, filter: &KvFilter) -> Result<Publication> {
        let filter = filter.compile()?;
        self.request(area, |resp_chan| AreaCommand::GetKeyValsFiltered { filter, resp_chan })
            .await
    }

    pub async fn get_hashes_filtered(&self, area: &str, filter: &KvFilter) -> Result<Publication> {
        let filter = filter.compile()?;
        self.request(area, |resp_chan| AreaCommand::GetHashesFiltered { filter, resp_chan })
            .await
    }

    pub async fn set_key_vals(&self, area: &str, key_vals: KeyVals) -> Result<MergeSummary> {
        self.request(area, |resp_chan| AreaCommand::SetKeyVals {
            key_vals,
            resp_chan,
        })
        .await
    }

    pub async fn set_local_key(&self, area: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.request(area, |resp_chan| AreaCommand::SetLocalKey {
            key,
            value,
            resp_chan,
        })
        .await
    }

    /// Stop refreshing `key`; returns whether it was a local key
    pub async fn unset_local_key(&self, area: &str, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.request(area, |resp_chan| AreaCommand::UnsetLocalKey { key, resp_chan })
            .await
    }

    /// Snapshot of every requested area (all areas when `areas` is empty)
    /// plus one stream of the publications that follow.
    ///
    /// Each snapshot and its stream are taken in the same area step, so the
    /// stream carries every change after the snapshot exactly once.
    pub async fn subscribe(
        &self,
        filter: &KvFilter,
        areas: &[String],
    ) -> Result<(Vec<Publication>, PublicationStream)> {
        let compiled = filter.compile()?;
        let areas = if areas.is_empty() {
            self.area_ids()
        } else {
            areas.to_vec()
        };
        for area in areas.iter() {
            self.area(area)?;
        }

        let mut snapshots = Vec::with_capacity(areas.len());
        let mut receivers = Vec::with_capacity(areas.len());
        for area in areas.iter() {
            let filter = compiled.clone();
            let (snapshot, rx) = self
                .request(area, |resp_chan| AreaCommand::Subscribe { filter, resp_chan })
                .await?;
            snapshots.push(snapshot);
            receivers.push(rx);
        }
        debug!(
            "[{}] New subscriber for areas {:?}",
            self.node_name, areas
        );
        Ok((snapshots, merge_receivers(receivers)))
    }

    /// Per-area counts; unknown areas are skipped
    pub async fn get_area_summary(&self, areas: &[String]) -> Result<Vec<AreaSummary>> {
        let areas = if areas.is_empty() {
            self.area_ids()
        } else {
            areas.to_vec()
        };
        let mut summaries = Vec::new();
        for area in areas.iter() {
            if !self.areas.contains_key(area) {
                continue;
            }
            summaries.push(
                self.request(area, |resp_chan| AreaCommand::Summary { resp_chan })
                    .await?,
            );
        }
        Ok(summaries)
    }

    pub async fn add_peer(&self, area: &str, name: NodeName, addr: &str) -> Result<()> {
        let addr = addr.to_string();
        self.request(area, |resp_chan| AreaCommand::AddPeer {
            name,
            addr,
            resp_chan,
        })
        .await
    }

    pub async fn del_peer(&self, area: &str, name: NodeName) -> Result<bool> {
        self.request(area, |resp_chan| AreaCommand::DelPeer { name, resp_chan })
            .await
    }

    pub async fn get_peers(&self, area: &str) -> Result<Vec<PeerInfo>> {
        self.request(area, |resp_chan| AreaCommand::GetPeers { resp_chan })
            .await
    }

    pub async fn process_flood_message(&self, area: &str, messages: DualMessages) -> Result<()> {
        self.request(area, |resp_chan| AreaCommand::ProcessFloodMessage {
            messages,
            resp_chan,
        })
        .await
    }

    pub async fn set_flood_root_child(&self, area: &str, params: FloodTopoSetParams) -> Result<()> {
        self.request(area, |resp_chan| AreaCommand::SetFloodRootChild { params, resp_chan })
            .await
    }

    pub async fn get_spanning_tree_info(&self, area: &str) -> Result<SptInfos> {
        self.request(area, |resp_chan| AreaCommand::GetSpanningTreeInfo { resp_chan })
            .await
    }

    /// Answer one packet from a peer. Failures become `Error` packets so the
    /// peer always gets a response.
    pub async fn handle_peer_packet(&self, packet: PeerPacket) -> PeerPacket {
        let area = packet.area.clone();
        let Ok(tx) = self.area(&area) else {
            warn!(
                "[{}] Packet from {} for unknown area {}",
                self.node_name, packet.sender, area
            );
            return PeerPacket::error(&area, &self.node_name, format!("Unknown area: {}", area));
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        if tx
            .send(AreaCommand::PeerPacket {
                packet,
                resp_chan: resp_tx,
            })
            .await
            .is_err()
        {
            return PeerPacket::error(&area, &self.node_name, format!("Area {} is gone", area));
        }
        match resp_rx.await {
            Ok(reply) => reply,
            Err(_) => PeerPacket::error(
                &area,
                &self.node_name,
                format!("Area {} dropped the request", area),
            ),
        }
    }

    /// Answer inbound peer requests until the transport closes
    pub fn serve_peers(&self, mut inbound_rx: mpsc::Receiver<InboundRequest>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(request) = inbound_rx.recv().await {
                let node = node.clone();
                tokio::spawn(async move {
                    let reply = node.handle_peer_packet(request.packet).await;
                    if request.response_tx.send(reply).is_err() {
                        debug!("[{}] Peer hung up before the reply", node.node_name);
                    }
                });
            }
            info!("[{}] Peer request channel closed", node.node_name);
        })
    }
}
