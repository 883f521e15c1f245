//! DUAL-style distance-vector convergence towards one flood root.
//!
//! `Dual` is a pure state machine: every input returns the messages to send
//! and whether the parent changed, and the caller owns all I/O. A node only
//! switches parent without asking its neighbors when the new parent satisfies
//! the feasibility condition (reported distance strictly below our feasible
//! distance). Otherwise it goes active, queries every neighbor, and picks a
//! parent once all replies are in.
use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::node::NodeName;

/// Distance of an unreachable root
pub const DUAL_INFINITY: i64 = i64::MAX;

/// Cost of every peer link
const LINK_COST: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum DualMessageType {
    Update,
    Query,
    Reply,
}

/// One advertisement about one root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct DualMessage {
    pub root_id: NodeName,
    pub root_priority: u32,
    pub distance: i64,
    pub kind: DualMessageType,
}

/// A batch of advertisements from one sender
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct DualMessages {
    pub sender: NodeName,
    pub messages: Vec<DualMessage>,
}

/// Child registration sent by a node to its (old or new) parent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct FloodTopoSetParams {
    pub root_id: NodeName,
    pub child: NodeName,
    pub set_child: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualCounters {
    pub updates_sent: u64,
    pub queries_sent: u64,
    pub replies_sent: u64,
    pub updates_received: u64,
    pub queries_received: u64,
    pub replies_received: u64,
}

impl DualCounters {
    pub fn total_sent(&self) -> u64 {
        self.updates_sent + self.queries_sent + self.replies_sent
    }

    pub fn total_received(&self) -> u64 {
        self.updates_received + self.queries_received + self.replies_received
    }

    pub fn record_sent(&mut self, kind: DualMessageType) {
        match kind {
            DualMessageType::Update => self.updates_sent += 1,
            DualMessageType::Query => self.queries_sent += 1,
            DualMessageType::Reply => self.replies_sent += 1,
        }
    }

    pub fn record_received(&mut self, kind: DualMessageType) {
        match kind {
            DualMessageType::Update => self.updates_received += 1,
            DualMessageType::Query => self.queries_received += 1,
            DualMessageType::Reply => self.replies_received += 1,
        }
    }

    pub fn add(&mut self, other: &DualCounters) {
        self.updates_sent += other.updates_sent;
        self.queries_sent += other.queries_sent;
        self.replies_sent += other.replies_sent;
        self.updates_received += other.updates_received;
        self.queries_received += other.queries_received;
        self.replies_received += other.replies_received;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DualState {
    Passive,
    Active,
}

#[derive(Clone, Debug)]
struct Neighbor {
    report_distance: i64,
    expect_reply: bool,
    need_to_reply: bool,
}

impl Default for Neighbor {
    fn default() -> Self {
        Self {
            report_distance: DUAL_INFINITY,
            expect_reply: false,
            need_to_reply: false,
        }
    }
}

/// What a `Dual` input produced
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DualOutput {
    pub messages: Vec<(NodeName, DualMessage)>,
    /// `(old, new)` parent when it changed
    pub parent_change: Option<(Option<NodeName>, Option<NodeName>)>,
}

impl DualOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.parent_change.is_none()
    }
}

fn add_cost(distance: i64) -> i64 {
    if distance == DUAL_INFINITY {
        DUAL_INFINITY
    } else {
        distance.saturating_add(LINK_COST)
    }
}

#[derive(Clone, Debug)]
pub struct Dual {
    node: NodeName,
    root_id: NodeName,
    root_priority: u32,
    distance: i64,
    feasible_distance: i64,
    nexthop: Option<NodeName>,
    state: DualState,
    neighbors: BTreeMap<NodeName, Neighbor>,
    counters: DualCounters,
}

impl Dual {
    /// Instance for a root this node has heard about
    pub fn new(node: NodeName, root_id: NodeName, root_priority: u32) -> Self {
        Self {
            node,
            root_id,
            root_priority,
            distance: DUAL_INFINITY,
            feasible_distance: DUAL_INFINITY,
            nexthop: None,
            state: DualState::Passive,
            neighbors: BTreeMap::new(),
            counters: DualCounters::default(),
        }
    }

    /// Instance for which this node is the root
    pub fn new_root(node: NodeName, root_priority: u32) -> Self {
        Self {
            root_id: node.clone(),
            nexthop: Some(node.clone()),
            node,
            root_priority,
            distance: 0,
            feasible_distance: 0,
            state: DualState::Passive,
            neighbors: BTreeMap::new(),
            counters: DualCounters::default(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.node == self.root_id
    }

    pub fn root_id(&self) -> &NodeName {
        &self.root_id
    }

    pub fn root_priority(&self) -> u32 {
        self.root_priority
    }

    pub fn distance(&self) -> i64 {
        self.distance
    }

    pub fn is_reachable(&self) -> bool {
        self.distance != DUAL_INFINITY
    }

    /// Parent towards the root; the root is its own parent
    pub fn nexthop(&self) -> Option<&NodeName> {
        self.nexthop.as_ref()
    }

    pub fn state(&self) -> DualState {
        self.state
    }

    pub fn counters(&self) -> &DualCounters {
        &self.counters
    }

    pub fn has_neighbor(&self, neighbor: &NodeName) -> bool {
        self.neighbors.contains_key(neighbor)
    }

    /// A neighbor came up; tell it what we know
    pub fn peer_up(&mut self, neighbor: &NodeName) -> DualOutput {
        let mut out = DualOutput::default();
        self.neighbors.entry(neighbor.clone()).or_default();
        if self.is_reachable() && self.state == DualState::Passive {
            self.send(&mut out, neighbor, DualMessageType::Update);
        }
        out
    }

    /// Register a neighbor without advertising to it
    pub fn add_neighbor_silently(&mut self, neighbor: &NodeName) {
        self.neighbors.entry(neighbor.clone()).or_default();
    }

    /// Our current distance as an update, if we have one to give
    pub fn announcement(&mut self) -> Option<DualMessage> {
        if self.is_reachable() && self.state == DualState::Passive {
            self.counters.updates_sent += 1;
            Some(self.message(DualMessageType::Update))
        } else {
            None
        }
    }

    pub fn peer_down(&mut self, neighbor: &NodeName) -> DualOutput {
        let mut out = DualOutput::default();
        if self.neighbors.remove(neighbor).is_none() {
            return out;
        }
        match self.state {
            DualState::Active => {
                if self.all_replies_received() {
                    self.finish_diffusing(&mut out);
                }
            }
            DualState::Passive => {
                if self.nexthop.as_ref() == Some(neighbor) {
                    self.local_computation(&mut out);
                }
            }
        }
        out
    }

    pub fn receive(&mut self, from: &NodeName, message: &DualMessage) -> DualOutput {
        let mut out = DualOutput::default();
        self.counters.record_received(message.kind);
        let neighbor = self.neighbors.entry(from.clone()).or_default();
        neighbor.report_distance = message.distance;

        match (message.kind, self.state) {
            (DualMessageType::Update, DualState::Passive) => {
                self.local_computation(&mut out);
            }
            (DualMessageType::Update, DualState::Active) => {}
            (DualMessageType::Query, DualState::Passive) => {
                self.local_computation(&mut out);
                if self.state == DualState::Active {
                    // Our successor lost its route and so did we: answer once
                    // our own computation completes
                    if let Some(n) = self.neighbors.get_mut(from) {
                        n.need_to_reply = true;
                    }
                } else {
                    self.send(&mut out, from, DualMessageType::Reply);
                }
            }
            (DualMessageType::Query, DualState::Active) => {
                self.send(&mut out, from, DualMessageType::Reply);
            }
            (DualMessageType::Reply, _) => {
                if let Some(n) = self.neighbors.get_mut(from) {
                    n.expect_reply = false;
                }
                if self.state == DualState::Active && self.all_replies_received() {
                    self.finish_diffusing(&mut out);
                }
            }
        }
        out
    }

    fn best(&self) -> Option<(NodeName, i64)> {
        let mut best: Option<(&NodeName, i64)> = None;
        for (name, neighbor) in self.neighbors.iter() {
            if neighbor.report_distance == DUAL_INFINITY {
                continue;
            }
            match best {
                Some((_, d)) if d <= neighbor.report_distance => {}
                _ => best = Some((name, neighbor.report_distance)),
            }
        }
        best.map(|(name, d)| (name.clone(), d))
    }

    fn all_replies_received(&self) -> bool {
        self.neighbors.values().all(|n| !n.expect_reply)
    }

    fn local_computation(&mut self, out: &mut DualOutput) {
        if self.is_root() {
            return;
        }
        match self.best() {
            Some((neighbor, reported)) if reported < self.feasible_distance => {
                let distance = add_cost(reported);
                self.feasible_distance = self.feasible_distance.min(distance);
                self.set_route(out, distance, Some(neighbor));
            }
            best => {
                if best.is_none() && !self.is_reachable() {
                    return;
                }
                if self.neighbors.is_empty() {
                    self.feasible_distance = DUAL_INFINITY;
                    self.set_route(out, DUAL_INFINITY, None);
                    return;
                }
                self.go_active(out);
            }
        }
    }

    fn go_active(&mut self, out: &mut DualOutput) {
        self.state = DualState::Active;
        self.set_parent(out, None);
        self.distance = DUAL_INFINITY;
        let names: Vec<NodeName> = self.neighbors.keys().cloned().collect();
        for name in names.iter() {
            if let Some(n) = self.neighbors.get_mut(name) {
                n.expect_reply = true;
            }
            self.send(out, name, DualMessageType::Query);
        }
    }

    fn finish_diffusing(&mut self, out: &mut DualOutput) {
        self.state = DualState::Passive;
        let (distance, nexthop) = match self.best() {
            Some((neighbor, reported)) => (add_cost(reported), Some(neighbor)),
            None => (DUAL_INFINITY, None),
        };
        self.feasible_distance = distance;
        self.distance = distance;
        self.set_parent(out, nexthop);

        let names: Vec<NodeName> = self.neighbors.keys().cloned().collect();
        for name in names.iter() {
            let owes_reply = self
                .neighbors
                .get_mut(name)
                .map(|n| std::mem::replace(&mut n.need_to_reply, false))
                .unwrap_or(false);
            if owes_reply {
                self.send(out, name, DualMessageType::Reply);
            } else {
                self.send(out, name, DualMessageType::Update);
            }
        }
    }

    fn set_route(&mut self, out: &mut DualOutput, distance: i64, nexthop: Option<NodeName>) {
        let distance_changed = distance != self.distance;
        self.distance = distance;
        self.set_parent(out, nexthop);
        if distance_changed {
            let names: Vec<NodeName> = self.neighbors.keys().cloned().collect();
            for name in names.iter() {
                self.send(out, name, DualMessageType::Update);
            }
        }
    }

    fn set_parent(&mut self, out: &mut DualOutput, nexthop: Option<NodeName>) {
        if self.nexthop != nexthop {
            let old = std::mem::replace(&mut self.nexthop, nexthop.clone());
            // Keep the oldest `old` when the parent changes twice in one input
            let old = match out.parent_change.take() {
                Some((first_old, _)) => first_old,
                None => old,
            };
            out.parent_change = if old == nexthop {
                None
            } else {
                Some((old, nexthop))
            };
        }
    }

    fn message(&self, kind: DualMessageType) -> DualMessage {
        DualMessage {
            root_id: self.root_id.clone(),
            root_priority: self.root_priority,
            distance: self.distance,
            kind,
        }
    }

    fn send(&mut self, out: &mut DualOutput, to: &NodeName, kind: DualMessageType) {
        self.counters.record_sent(kind);
        out.messages.push((to.clone(), self.message(kind)));
    }
}
