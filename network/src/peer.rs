// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Peer model

use crate::protocols::{PeerDescriptor, PeerId};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// How a peer can currently be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Physical connection to the peer exists
    Direct,
    /// Reachable through one or more relays
    Relayed,
    /// Known but not reachable
    Unreachable,
}

/// Information about a peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer id
    pub id: PeerId,

    /// Isolation domain the peer belongs to
    pub domain: String,

    /// Hop count from the local peer; 1 means direct, `None` unreachable
    pub distance: Option<u32>,

    /// Endpoints the peer listens on
    pub listeners: Vec<SocketAddr>,

    /// Endpoints mapped on the peer's NAT gateway
    pub nat_endpoints: Vec<SocketAddr>,

    /// Peer is under a reachability block
    pub blocked: bool,

    /// Last time the peer was heard of
    pub last_seen: SystemTime,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(id: impl Into<PeerId>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            distance: None,
            listeners: Vec::new(),
            nat_endpoints: Vec::new(),
            blocked: false,
            last_seen: SystemTime::now(),
        }
    }

    /// Build from a propagated descriptor
    pub fn from_descriptor(descriptor: &PeerDescriptor) -> Self {
        Self {
            listeners: descriptor.listeners.clone(),
            nat_endpoints: descriptor.nat_endpoints.clone(),
            ..Self::new(descriptor.id.clone(), descriptor.domain.clone())
        }
    }

    /// Descriptor propagated to other peers
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.id.clone(),
            domain: self.domain.clone(),
            listeners: self.listeners.clone(),
            nat_endpoints: self.nat_endpoints.clone(),
        }
    }

    /// Current reachability
    pub fn state(&self) -> PeerState {
        match self.distance {
            Some(1) => PeerState::Direct,
            Some(_) => PeerState::Relayed,
            None => PeerState::Unreachable,
        }
    }

    /// Check if a physical connection to the peer exists
    pub fn is_direct(&self) -> bool {
        self.distance == Some(1)
    }

    /// Update last seen time
    pub fn update_last_seen(&mut self) {
        self.last_seen = SystemTime::now();
    }

    /// Get idle duration (time since last seen)
    pub fn idle_duration(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_seen)
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_info_creation() {
        let peer = PeerInfo::new("node-b", "lab");
        assert_eq!(peer.state(), PeerState::Unreachable);
        assert!(!peer.is_direct());
        assert!(!peer.blocked);
    }

    #[test]
    fn test_peer_state_from_distance() {
        let mut peer = PeerInfo::new("node-b", "lab");
        peer.distance = Some(1);
        assert_eq!(peer.state(), PeerState::Direct);
        peer.distance = Some(3);
        assert_eq!(peer.state(), PeerState::Relayed);
    }

    #[test]
    fn test_descriptor_round_trip_keeps_endpoints() {
        let mut peer = PeerInfo::new("node-b", "lab");
        peer.listeners.push("10.0.0.2:5000".parse().unwrap());
        let copy = PeerInfo::from_descriptor(&peer.descriptor());
        assert_eq!(copy.listeners, peer.listeners);
        assert_eq!(copy.domain, "lab");
    }
}
