// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! # TerraGraf Network
//!
//! Peer-to-peer overlay with routed messaging between peers identified by
//! string ids.
//!
//! ## Architecture
//!
//! The overlay is built from the following components:
//! - **Protocols**: Message model, wire framing and the negotiation handshake
//! - **Discovery**: UDP multicast/broadcast announcements of local endpoints
//! - **ConnectivityManager**: Listeners, NAT mapping and outbound tasks with
//!   scheduled retries
//! - **SessionManager**: Logical links per remote peer with active and
//!   redundant connections, de-duplication, relaying and acknowledgements
//! - **PeerGraph**: Known peers and shortest-path next hops
//! - **VirtualSocketManager**: Ordered byte channels over the overlay

pub mod application;
pub mod config;
pub mod connection;
pub mod connectivity_manager;
pub mod constants;
pub mod context;
pub mod counters;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod interfaces;
pub mod nat;
pub mod peer;
pub mod protocols;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod virtual_socket;

pub use application::{NetworkClient, NetworkInterface, NetworkService};
pub use config::{
    ConnectTaskConfig, DiscoveryConfig, DiscoveryMode, ListenerConfig, NatConfig, RetryPolicy,
    SessionConfig, SocketOptions, TerraGrafConfig,
};
pub use connectivity_manager::{ConnectionTask, ConnectivityManager, TaskId, TaskState};
pub use context::NetworkContext;
pub use counters::NetworkMetrics;
pub use discovery::{Dialer, DiscoveryService};
pub use error::{NetworkError, Result};
pub use graph::{IsolationPolicy, OpenPolicy, PeerGraph, SameDomainPolicy};
pub use nat::{PortMapper, PortMapping};
pub use peer::{PeerInfo, PeerState};
pub use protocols::{Message, MessageBody, MessageCode, MessageId, PeerId, Priority, TransportMode};
pub use session::{MessageTask, SessionManager};
pub use transport::{TcpTransport, Transport};
pub use virtual_socket::{VirtualListener, VirtualSocket, VirtualSocketManager};

/// Network events that can be received by applications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A session with a peer gained its first connection
    PeerConnected(PeerId),

    /// A session with a peer lost its last connection
    PeerDisconnected(PeerId),

    /// The peer graph changed
    TopologyChanged,
}

/// Watch for lock cycles on a background thread
#[cfg(feature = "deadlock-detection")]
pub fn spawn_deadlock_checker(interval: std::time::Duration) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }
        tracing::error!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            for thread in threads {
                tracing::error!(
                    "Deadlock #{} thread {:?}\n{:?}",
                    i,
                    thread.thread_id(),
                    thread.backtrace()
                );
            }
        }
    })
}
