// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Topology propagation payloads

use super::PeerId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// What a peer is known to offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub domain: String,
    pub listeners: Vec<SocketAddr>,
    pub nat_endpoints: Vec<SocketAddr>,
}

/// Undirected physical link between two peers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub a: PeerId,
    pub b: PeerId,
}

impl Relation {
    /// Build a relation with its ends in canonical order
    pub fn new(a: impl Into<PeerId>, b: impl Into<PeerId>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { a, b }
        } else {
            Self { a: b, b: a }
        }
    }

    pub fn involves(&self, id: &str) -> bool {
        self.a == id || self.b == id
    }
}

/// Topology information, discriminated explicitly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyInformation {
    /// Full view of `origin`'s graph
    Snapshot {
        origin: PeerId,
        peers: Vec<PeerDescriptor>,
        relations: Vec<Relation>,
    },
    /// One link appeared or vanished
    RelationUpdate { relation: Relation, connected: bool },
    /// Reachability block switched on or off for a peer
    Reachability { peer: PeerId, blocked: bool },
}

/// Single-attribute update about one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerUpdate {
    NatGateways {
        peer: PeerId,
        endpoints: Vec<SocketAddr>,
    },
    Domain {
        peer: PeerId,
        domain: String,
    },
    Listeners {
        peer: PeerId,
        endpoints: Vec<SocketAddr>,
    },
}

impl PeerUpdate {
    /// Peer the update is about
    pub fn peer(&self) -> &str {
        match self {
            PeerUpdate::NatGateways { peer, .. }
            | PeerUpdate::Domain { peer, .. }
            | PeerUpdate::Listeners { peer, .. } => peer,
        }
    }
}

impl TopologyInformation {
    /// Snapshot of a graph as seen by `origin`
    pub fn snapshot(origin: impl Into<PeerId>, peers: Vec<PeerDescriptor>, relations: Vec<Relation>) -> Self {
        TopologyInformation::Snapshot {
            origin: origin.into(),
            peers,
            relations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_is_canonical() {
        assert_eq!(Relation::new("b", "a"), Relation::new("a", "b"));
        assert!(Relation::new("x", "y").involves("y"));
        assert!(!Relation::new("x", "y").involves("z"));
    }
}
