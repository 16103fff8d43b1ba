// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Peer graph: known peers, their relations and hop distances
//!
//! Discovery and the session layer only see this module through
//! [`PeerLookup`] and [`IsolationPolicy`]. [`PeerGraph`] is the in-process
//! implementation fed by local connects/disconnects and by propagated
//! topology messages.

use crate::peer::PeerInfo;
use crate::protocols::{PeerDescriptor, PeerId, PeerUpdate, Relation, TopologyInformation};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

/// Decides whether two isolation domains may talk
pub trait IsolationPolicy: Send + Sync {
    fn is_allowed(&self, local_domain: &str, remote_domain: &str) -> bool;
}

/// Only peers of the same domain may connect
#[derive(Debug, Default, Clone, Copy)]
pub struct SameDomainPolicy;

impl IsolationPolicy for SameDomainPolicy {
    fn is_allowed(&self, local_domain: &str, remote_domain: &str) -> bool {
        local_domain == remote_domain
    }
}

/// Every domain may connect to every other
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenPolicy;

impl IsolationPolicy for OpenPolicy {
    fn is_allowed(&self, _local_domain: &str, _remote_domain: &str) -> bool {
        true
    }
}

/// Narrow lookup used by discovery and the session layer
pub trait PeerLookup: Send + Sync {
    /// Hop distance to a known, reachable peer
    fn lookup(&self, id: &str) -> Option<u32>;

    /// What the local peer currently offers
    fn local_peer(&self) -> PeerDescriptor;
}

/// Result of applying a change to the graph
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GraphChange {
    /// Relations or peer attributes changed
    pub changed: bool,
    /// Peers that were reachable before and are not anymore
    pub unreachable: Vec<PeerId>,
}

struct Route {
    distance: u32,
    first_hop: PeerId,
}

#[derive(Default)]
struct GraphState {
    peers: HashMap<PeerId, PeerInfo>,
    relations: HashSet<Relation>,
    blocked: HashSet<PeerId>,
    routes: HashMap<PeerId, Route>,
}

/// In-process peer graph
pub struct PeerGraph {
    local_id: PeerId,
    state: RwLock<GraphState>,
}

impl PeerGraph {
    /// Create a graph holding only the local peer
    pub fn new(local: PeerInfo) -> Self {
        let local_id = local.id.clone();
        let mut state = GraphState::default();
        let mut local = local;
        local.distance = Some(0);
        state.peers.insert(local_id.clone(), local);
        Self {
            local_id,
            state: RwLock::new(state),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Descriptor of the local peer
    pub fn local_descriptor(&self) -> PeerDescriptor {
        let state = self.state.read();
        state
            .peers
            .get(&self.local_id)
            .map(PeerInfo::descriptor)
            .unwrap_or_else(|| PeerDescriptor {
                id: self.local_id.clone(),
                domain: String::new(),
                listeners: Vec::new(),
                nat_endpoints: Vec::new(),
            })
    }

    /// Record the endpoints the local peer listens on
    pub fn set_local_listeners(&self, endpoints: Vec<SocketAddr>) {
        let mut state = self.state.write();
        if let Some(local) = state.peers.get_mut(&self.local_id) {
            local.listeners = endpoints;
        }
    }

    /// Add a NAT-mapped endpoint of the local peer
    pub fn add_local_nat_endpoint(&self, endpoint: SocketAddr) {
        let mut state = self.state.write();
        if let Some(local) = state.peers.get_mut(&self.local_id) {
            if !local.nat_endpoints.contains(&endpoint) {
                local.nat_endpoints.push(endpoint);
            }
        }
    }

    /// Get a peer by id
    pub fn peer(&self, id: &str) -> Option<PeerInfo> {
        self.state.read().peers.get(id).cloned()
    }

    /// All known peers except the local one
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state
            .read()
            .peers
            .values()
            .filter(|p| p.id != self.local_id)
            .cloned()
            .collect()
    }

    /// Peers with a physical connection
    pub fn direct_peers(&self) -> Vec<PeerId> {
        let state = self.state.read();
        state
            .routes
            .iter()
            .filter(|(_, route)| route.distance == 1)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Neighbour to forward a message for `target` through
    pub fn next_hop(&self, target: &str) -> Option<PeerId> {
        self.state
            .read()
            .routes
            .get(target)
            .map(|route| route.first_hop.clone())
    }

    /// A physical connection to `id` is up
    pub fn add_direct(&self, id: &str, domain: &str) -> GraphChange {
        let mut state = self.state.write();
        let peer = state
            .peers
            .entry(id.to_string())
            .or_insert_with(|| PeerInfo::new(id, domain));
        peer.domain = domain.to_string();
        peer.update_last_seen();

        let changed = state.relations.insert(Relation::new(&self.local_id, id));
        let unreachable = self.recompute(&mut state);
        GraphChange { changed, unreachable }
    }

    /// The last physical connection to `id` is gone
    pub fn remove_direct(&self, id: &str) -> GraphChange {
        let mut state = self.state.write();
        let changed = state.relations.remove(&Relation::new(&self.local_id, id));
        let unreachable = self.recompute(&mut state);
        GraphChange { changed, unreachable }
    }

    /// Apply propagated topology information
    ///
    /// Relations touching the local peer are ignored: only local
    /// connects and disconnects decide those. A snapshot is authoritative
    /// for the relations of its origin.
    pub fn apply_topology(&self, info: &TopologyInformation) -> GraphChange {
        let mut state = self.state.write();
        let mut changed = false;

        match info {
            TopologyInformation::Snapshot {
                origin,
                peers,
                relations,
            } => {
                for descriptor in peers {
                    if descriptor.id == self.local_id {
                        continue;
                    }
                    changed |= Self::merge_descriptor(&mut state, descriptor);
                }

                let reported: HashSet<&Relation> = relations
                    .iter()
                    .filter(|r| !r.involves(&self.local_id))
                    .collect();

                let stale: Vec<Relation> = state
                    .relations
                    .iter()
                    .filter(|r| r.involves(origin) && !r.involves(&self.local_id))
                    .filter(|r| !reported.contains(r))
                    .cloned()
                    .collect();
                for relation in stale {
                    state.relations.remove(&relation);
                    changed = true;
                }

                for relation in reported {
                    changed |= state.relations.insert(relation.clone());
                }
            }
            TopologyInformation::RelationUpdate { relation, connected } => {
                if !relation.involves(&self.local_id) {
                    for end in [&relation.a, &relation.b] {
                        state
                            .peers
                            .entry(end.clone())
                            .or_insert_with(|| PeerInfo::new(end.clone(), String::new()));
                    }
                    changed = if *connected {
                        state.relations.insert(relation.clone())
                    } else {
                        state.relations.remove(relation)
                    };
                }
            }
            TopologyInformation::Reachability { peer, blocked } => {
                changed = if *blocked {
                    state.blocked.insert(peer.clone())
                } else {
                    state.blocked.remove(peer)
                };
                if let Some(info) = state.peers.get_mut(peer) {
                    info.blocked = *blocked;
                }
            }
        }

        let unreachable = self.recompute(&mut state);
        GraphChange { changed, unreachable }
    }

    /// Apply a single-attribute peer update
    ///
    /// Updates about the local peer are ignored; it publishes its own.
    pub fn apply_peer_update(&self, update: &PeerUpdate) -> bool {
        let id = update.peer();
        if id == self.local_id {
            return false;
        }
        let mut state = self.state.write();
        let peer = state
            .peers
            .entry(id.to_string())
            .or_insert_with(|| PeerInfo::new(id, String::new()));

        let changed = match update {
            PeerUpdate::NatGateways { endpoints, .. } => {
                let changed = peer.nat_endpoints != *endpoints;
                peer.nat_endpoints = endpoints.clone();
                changed
            }
            PeerUpdate::Domain { domain, .. } => {
                let changed = peer.domain != *domain;
                peer.domain = domain.clone();
                changed
            }
            PeerUpdate::Listeners { endpoints, .. } => {
                let changed = peer.listeners != *endpoints;
                peer.listeners = endpoints.clone();
                changed
            }
        };
        peer.update_last_seen();
        changed
    }

    /// Full view of the graph for a newly connected neighbour
    pub fn snapshot(&self) -> TopologyInformation {
        let state = self.state.read();
        TopologyInformation::snapshot(
            self.local_id.clone(),
            state.peers.values().map(PeerInfo::descriptor).collect(),
            state.relations.iter().cloned().collect(),
        )
    }

    fn merge_descriptor(state: &mut GraphState, descriptor: &PeerDescriptor) -> bool {
        match state.peers.get_mut(&descriptor.id) {
            Some(existing) => {
                let changed = existing.domain != descriptor.domain
                    || existing.listeners != descriptor.listeners
                    || existing.nat_endpoints != descriptor.nat_endpoints;
                existing.domain = descriptor.domain.clone();
                existing.listeners = descriptor.listeners.clone();
                existing.nat_endpoints = descriptor.nat_endpoints.clone();
                changed
            }
            None => {
                state
                    .peers
                    .insert(descriptor.id.clone(), PeerInfo::from_descriptor(descriptor));
                true
            }
        }
    }

    /// Breadth-first distances from the local peer; blocked peers are
    /// reachable themselves but never relay.
    fn recompute(&self, state: &mut GraphState) -> Vec<PeerId> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for relation in &state.relations {
            adjacency.entry(&relation.a).or_default().push(&relation.b);
            adjacency.entry(&relation.b).or_default().push(&relation.a);
        }

        let mut routes: HashMap<PeerId, Route> = HashMap::new();
        let mut queue: VecDeque<(&str, u32, &str)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(&self.local_id);

        for neighbour in adjacency.get(self.local_id.as_str()).into_iter().flatten() {
            if visited.insert(neighbour) {
                queue.push_back((*neighbour, 1, *neighbour));
            }
        }

        while let Some((node, distance, first_hop)) = queue.pop_front() {
            routes.insert(
                node.to_string(),
                Route {
                    distance,
                    first_hop: first_hop.to_string(),
                },
            );
            if state.blocked.contains(node) {
                continue;
            }
            for next in adjacency.get(node).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back((*next, distance + 1, first_hop));
                }
            }
        }

        let unreachable: Vec<PeerId> = state
            .routes
            .keys()
            .filter(|id| !routes.contains_key(*id))
            .cloned()
            .collect();

        for (id, peer) in state.peers.iter_mut() {
            if *id == self.local_id {
                continue;
            }
            peer.distance = routes.get(id).map(|r| r.distance);
        }
        state.routes = routes;

        unreachable
    }
}

impl PeerLookup for PeerGraph {
    fn lookup(&self, id: &str) -> Option<u32> {
        if id == self.local_id {
            return Some(0);
        }
        self.state.read().routes.get(id).map(|route| route.distance)
    }

    fn local_peer(&self) -> PeerDescriptor {
        self.local_descriptor()
    }
}
