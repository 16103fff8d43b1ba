// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network interface for applications

use crate::error::Result;
use crate::peer::PeerInfo;
use crate::protocols::{MessageBody, PeerId, Priority, TransportMode};
use crate::session::MessageTask;
use crate::virtual_socket::{VirtualListener, VirtualSocket};
use async_trait::async_trait;
use std::time::Duration;

/// Network interface for applications
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    /// Route a message to a peer
    async fn send(
        &self,
        target: &str,
        body: MessageBody,
        priority: Priority,
        mode: TransportMode,
    ) -> Result<MessageTask>;

    /// Route a reliable-mode message and wait for its acknowledgement
    async fn send_and_wait(
        &self,
        target: &str,
        body: MessageBody,
        priority: Priority,
        timeout: Duration,
    ) -> Result<bool>;

    /// Peers with an open session
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Get the number of connected peers
    async fn peer_count(&self) -> usize;

    /// Every peer known to the graph
    async fn known_peers(&self) -> Vec<PeerInfo>;

    /// Open a virtual socket to `port` on `peer`
    async fn open_socket(&self, peer: &str, port: u16, timeout: Duration) -> Result<VirtualSocket>;

    /// Accept virtual sockets on `port`
    async fn listen_socket(&self, port: u16) -> Result<VirtualListener>;
}
