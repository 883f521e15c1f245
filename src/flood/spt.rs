//! Spanning-tree bookkeeping for one area: one `Dual` per known flood root,
//! the children that registered with us, and the elected root whose tree the
//! flooding engine follows.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::dual::{
    Dual, DualCounters, DualMessage, DualMessages, DualOutput, DualState, FloodTopoSetParams,
};
use crate::node::NodeName;

/// Per-root view exposed by `get_spanning_tree_info`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SptInfo {
    pub passive: bool,
    pub cost: i64,
    pub parent: Option<NodeName>,
    pub children: BTreeSet<NodeName>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SptInfos {
    pub infos: BTreeMap<NodeName, SptInfo>,
    pub flood_root_id: Option<NodeName>,
    pub flood_peers: BTreeSet<NodeName>,
    pub counters: DualCounters,
    pub neighbor_counters: BTreeMap<NodeName, DualCounters>,
}

/// Outbound work produced by the spanning tree
#[derive(Debug, Default)]
pub struct SptOutput {
    pub dual: BTreeMap<NodeName, Vec<DualMessage>>,
    pub topo_sets: Vec<(NodeName, FloodTopoSetParams)>,
}

impl SptOutput {
    pub fn is_empty(&self) -> bool {
        self.dual.is_empty() && self.topo_sets.is_empty()
    }

    /// Dual batches ready for the wire, keyed by destination
    pub fn dual_batches(&mut self, sender: &NodeName) -> Vec<(NodeName, DualMessages)> {
        std::mem::take(&mut self.dual)
            .into_iter()
            .map(|(to, messages)| {
                (
                    to,
                    DualMessages {
                        sender: sender.clone(),
                        messages,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct SptManager {
    node: NodeName,
    neighbors: BTreeSet<NodeName>,
    /// Neighbors we have received at least one batch from since they came up
    heard: HashSet<NodeName>,
    duals: BTreeMap<NodeName, Dual>,
    children: BTreeMap<NodeName, BTreeSet<NodeName>>,
    neighbor_counters: BTreeMap<NodeName, DualCounters>,
}

impl SptManager {
    pub fn new(node: NodeName, root_priority: Option<u32>) -> Self {
        let mut duals = BTreeMap::new();
        if let Some(priority) = root_priority {
            duals.insert(node.clone(), Dual::new_root(node.clone(), priority));
        }
        Self {
            node,
            neighbors: BTreeSet::new(),
            heard: HashSet::new(),
            duals,
            children: BTreeMap::new(),
            neighbor_counters: BTreeMap::new(),
        }
    }

    pub fn neighbors(&self) -> &BTreeSet<NodeName> {
        &self.neighbors
    }

    pub fn peer_up(&mut self, neighbor: &NodeName) -> SptOutput {
        let mut out = SptOutput::default();
        self.neighbors.insert(neighbor.clone());
        self.heard.remove(neighbor);
        let roots: Vec<NodeName> = self.duals.keys().cloned().collect();
        for root in roots {
            if let Some(dual) = self.duals.get_mut(&root) {
                let result = dual.peer_up(neighbor);
                self.absorb(&mut out, &root, result);
            }
        }
        out
    }

    pub fn peer_down(&mut self, neighbor: &NodeName) -> SptOutput {
        let mut out = SptOutput::default();
        if !self.neighbors.remove(neighbor) {
            return out;
        }
        self.heard.remove(neighbor);
        for children in self.children.values_mut() {
            children.remove(neighbor);
        }
        let roots: Vec<NodeName> = self.duals.keys().cloned().collect();
        for root in roots {
            if let Some(dual) = self.duals.get_mut(&root) {
                let result = dual.peer_down(neighbor);
                self.absorb(&mut out, &root, result);
            }
        }
        out
    }

    /// Feed a batch of dual messages from a neighbor
    pub fn process_dual_messages(&mut self, batch: &DualMessages) -> SptOutput {
        let mut out = SptOutput::default();
        let sender = &batch.sender;
        if !self.neighbors.contains(sender) {
            debug!(
                "[{}] Ignoring dual messages from non-neighbor {}",
                self.node, sender
            );
            return out;
        }

        // The neighbor may have come up before it knew about us, so it may
        // have dropped our first announcement; repeat it once
        if self.heard.insert(sender.clone()) {
            for dual in self.duals.values_mut() {
                if let Some(message) = dual.announcement() {
                    self.neighbor_counters
                        .entry(sender.clone())
                        .or_default()
                        .record_sent(message.kind);
                    out.dual.entry(sender.clone()).or_default().push(message);
                }
            }
        }

        let counters = self.neighbor_counters.entry(sender.clone()).or_default();
        for message in batch.messages.iter() {
            counters.record_received(message.kind);
        }

        for message in batch.messages.iter() {
            let root = message.root_id.clone();
            if !self.duals.contains_key(&root) {
                if root == self.node {
                    // Stale advertisement about us as a root we no longer are
                    continue;
                }
                info!(
                    "[{}] Discovered flood root {} (priority {})",
                    self.node, root, message.root_priority
                );
                let mut dual = Dual::new(self.node.clone(), root.clone(), message.root_priority);
                for neighbor in self.neighbors.iter() {
                    dual.add_neighbor_silently(neighbor);
                }
                self.duals.insert(root.clone(), dual);
            }
            if let Some(dual) = self.duals.get_mut(&root) {
                let result = dual.receive(sender, message);
                self.absorb(&mut out, &root, result);
            }
        }

        // A parent that dropped and re-added us has forgotten that we are its
        // child; registrations are idempotent, so repeat ours
        for (root, dual) in self.duals.iter() {
            if dual.nexthop() != Some(sender) || sender == &self.node {
                continue;
            }
            let pending = out
                .topo_sets
                .iter()
                .any(|(to, params)| to == sender && &params.root_id == root);
            if !pending {
                out.topo_sets.push((
                    sender.clone(),
                    FloodTopoSetParams {
                        root_id: root.clone(),
                        child: self.node.clone(),
                        set_child: true,
                    },
                ));
            }
        }
        out
    }

    /// A neighbor registers or unregisters itself as our child for `root_id`
    pub fn set_flood_root_child(&mut self, params: &FloodTopoSetParams) {
        let children = self.children.entry(params.root_id.clone()).or_default();
        if params.set_child {
            if self.neighbors.contains(&params.child) {
                children.insert(params.child.clone());
            }
        } else {
            children.remove(&params.child);
        }
    }

    /// The reachable root with the lowest `(priority, root id)`
    pub fn flood_root(&self) -> Option<&NodeName> {
        self.duals
            .values()
            .filter(|d| d.is_reachable())
            .min_by(|a, b| {
                (a.root_priority(), a.root_id()).cmp(&(b.root_priority(), b.root_id()))
            })
            .map(|d| d.root_id())
    }

    /// Tree neighbors for the elected root: parent and children. `None` when
    /// no root is reachable and the caller should fall back to full flooding.
    pub fn flood_peers(&self) -> Option<BTreeSet<NodeName>> {
        let root = self.flood_root()?;
        let dual = self.duals.get(root)?;
        let mut peers: BTreeSet<NodeName> = self
            .children
            .get(root)
            .map(|c| c.iter().filter(|n| self.neighbors.contains(*n)).cloned().collect())
            .unwrap_or_default();
        if let Some(parent) = dual.nexthop() {
            if parent != &self.node {
                peers.insert(parent.clone());
            }
        }
        Some(peers)
    }

    pub fn info(&self) -> SptInfos {
        let mut counters = DualCounters::default();
        let infos = self
            .duals
            .iter()
            .map(|(root, dual)| {
                counters.add(dual.counters());
                let info = SptInfo {
                    passive: dual.state() == DualState::Passive,
                    cost: dual.distance(),
                    parent: dual.nexthop().cloned(),
                    children: self.children.get(root).cloned().unwrap_or_default(),
                };
                (root.clone(), info)
            })
            .collect();
        SptInfos {
            infos,
            flood_root_id: self.flood_root().cloned(),
            flood_peers: self.flood_peers().unwrap_or_default(),
            counters,
            neighbor_counters: self.neighbor_counters.clone(),
        }
    }

    fn absorb(&mut self, out: &mut SptOutput, root: &NodeName, result: DualOutput) {
        for (to, message) in result.messages {
            self.neighbor_counters
                .entry(to.clone())
                .or_default()
                .record_sent(message.kind);
            out.dual.entry(to).or_default().push(message);
        }
        if let Some((old, new)) = result.parent_change {
            info!(
                "[{}] Parent for root {} changed: {:?} -> {:?}",
                self.node, root, old, new
            );
            if let Some(old) = old {
                if old != self.node && self.neighbors.contains(&old) {
                    out.topo_sets.push((
                        old,
                        FloodTopoSetParams {
                            root_id: root.clone(),
                            child: self.node.clone(),
                            set_child: false,
                        },
                    ));
                }
            }
            if let Some(new) = new {
                if new != self.node {
                    out.topo_sets.push((
                        new,
                        FloodTopoSetParams {
                            root_id: root.clone(),
                            child: self.node.clone(),
                            set_child: true,
                        },
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(name: &str) -> NodeName {
        NodeName::from(name)
    }

    #[test]
    fn test_root_info_has_zero_cost_and_self_parent() {
        let mut spt = SptManager::new(n("a"), Some(0));
        spt.peer_up(&n("b"));
        let info = spt.info();
        let root_info = &info.infos[&n("a")];
        assert_eq!(root_info.cost, 0);
        assert_eq!(root_info.parent, Some(n("a")));
        assert!(root_info.passive);
        assert_eq!(info.flood_root_id, Some(n("a")));
        assert_eq!(info.infos.len(), 1);
    }

    #[test]
    fn test_no_root_means_full_flood() {
        let mut spt = SptManager::new(n("a"), None);
        spt.peer_up(&n("b"));
        assert!(spt.flood_root().is_none());
        assert!(spt.flood_peers().is_none());
    }

    #[test]
    fn test_children_registration() {
        let mut spt = SptManager::new(n("a"), Some(0));
        spt.peer_up(&n("b"));
        spt.set_flood_root_child(&FloodTopoSetParams {
            root_id: n("a"),
            child: n("b"),
            set_child: true,
        });
        assert_eq!(spt.flood_peers().unwrap(), BTreeSet::from([n("b")]));

        spt.peer_down(&n("b"));
        assert!(spt.flood_peers().unwrap().is_empty());
    }

    #[test]
    fn test_messages_from_non_neighbors_ignored() {
        let mut spt = SptManager::new(n("b"), None);
        let out = spt.process_dual_messages(&DualMessages {
            sender: n("a"),
            messages: vec![],
        });
        assert!(out.is_empty());
    }
}
