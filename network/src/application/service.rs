// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network service implementation

use crate::{
    application::interface::NetworkInterface,
    config::{ConnectTaskConfig, TerraGrafConfig},
    connectivity_manager::{ConnectivityManager, TaskId},
    context::NetworkContext,
    counters::NetworkMetrics,
    discovery::{Dialer, DiscoveryService},
    error::{NetworkError, Result},
    graph::{IsolationPolicy, PeerGraph, PeerLookup},
    interfaces::{InterfaceProvider, SystemInterfaces},
    nat::{PortMapper, UpnpPortMapper},
    peer::PeerInfo,
    protocols::wire::{BincodeFormatter, Handshake, MessageCodec},
    protocols::{Message, MessageBody, PeerId, Priority, TransportMode},
    session::{ConnectionLost, MessageTask, SessionManager, SessionOutputs},
    transport::{TcpTransport, Transport},
    virtual_socket::{VirtualListener, VirtualSocket, VirtualSocketManager},
    NetworkEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Network client for sending messages
#[derive(Clone)]
pub struct NetworkClient {
    sessions: Arc<SessionManager>,
    sockets: Arc<VirtualSocketManager>,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(sessions: Arc<SessionManager>, sockets: Arc<VirtualSocketManager>) -> Self {
        Self { sessions, sockets }
    }

    fn message(
        &self,
        target: &str,
        body: MessageBody,
        priority: Priority,
        mode: TransportMode,
    ) -> Result<Message> {
        self.sessions.context().routed(target, priority, mode, body)
    }
}

#[async_trait]
impl NetworkInterface for NetworkClient {
    async fn send(
        &self,
        target: &str,
        body: MessageBody,
        priority: Priority,
        mode: TransportMode,
    ) -> Result<MessageTask> {
        let message = self.message(target, body, priority, mode)?;
        self.sessions.send(message)
    }

    async fn send_and_wait(
        &self,
        target: &str,
        body: MessageBody,
        priority: Priority,
        timeout: Duration,
    ) -> Result<bool> {
        let message = self.message(target, body, priority, TransportMode::ReliableOrdered)?;
        Ok(self.sessions.send_and_wait(message, timeout).await)
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.sessions.connected_peers()
    }

    async fn peer_count(&self) -> usize {
        self.sessions.connected_peers().len()
    }

    async fn known_peers(&self) -> Vec<PeerInfo> {
        self.sessions.graph().peers()
    }

    async fn open_socket(&self, peer: &str, port: u16, timeout: Duration) -> Result<VirtualSocket> {
        self.sockets.connect(peer, port, timeout).await
    }

    async fn listen_socket(&self, port: u16) -> Result<VirtualListener> {
        self.sockets.listen(port)
    }
}

type StartInputs = (
    mpsc::UnboundedReceiver<ConnectionLost>,
    mpsc::UnboundedReceiver<Message>,
);

/// Network service
pub struct NetworkService {
    config: TerraGrafConfig,
    graph: Arc<PeerGraph>,
    sessions: Arc<SessionManager>,
    connectivity: Arc<ConnectivityManager>,
    discovery: Arc<DiscoveryService>,
    sockets: Arc<VirtualSocketManager>,
    metrics: NetworkMetrics,
    inputs: Mutex<Option<StartInputs>>,
    socket_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl NetworkService {
    /// Create a new network service over TCP and the host's interfaces
    ///
    /// With NAT mapping enabled, ports are mapped on the UPnP gateway of the
    /// local network.
    pub fn new(
        config: TerraGrafConfig,
        policy: Arc<dyn IsolationPolicy>,
        event_tx: mpsc::Sender<NetworkEvent>,
    ) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.socket));
        let port_mapper = config
            .nat
            .enabled
            .then(|| Arc::new(UpnpPortMapper::default()) as Arc<dyn PortMapper>);
        Self::with_components(
            config,
            policy,
            event_tx,
            transport,
            Arc::new(SystemInterfaces),
            port_mapper,
        )
    }

    /// Create a network service from explicit components
    pub fn with_components(
        config: TerraGrafConfig,
        policy: Arc<dyn IsolationPolicy>,
        event_tx: mpsc::Sender<NetworkEvent>,
        transport: Arc<dyn Transport>,
        interfaces: Arc<dyn InterfaceProvider>,
        port_mapper: Option<Arc<dyn PortMapper>>,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = Arc::new(NetworkContext::new(config.local_id.clone(), config.domain.clone())?);
        let graph = Arc::new(PeerGraph::new(PeerInfo::new(
            config.local_id.clone(),
            config.domain.clone(),
        )));
        let codec = MessageCodec::new(config.max_frame_size, Arc::new(BincodeFormatter));
        let metrics = NetworkMetrics::new();

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionManager::new(
            ctx.clone(),
            graph.clone(),
            Handshake::new(config.domain.clone(), policy.clone()),
            codec.clone(),
            config.session.clone(),
            SessionOutputs {
                events: event_tx,
                lost: lost_tx,
                sockets: sockets_tx,
            },
            metrics.clone(),
        ));

        let mut connectivity = ConnectivityManager::new(
            config.clone(),
            sessions.clone(),
            transport,
            interfaces,
            metrics.clone(),
        );
        if let Some(mapper) = port_mapper {
            connectivity = connectivity.with_port_mapper(mapper);
        }
        let connectivity = Arc::new(connectivity);

        let discovery = Arc::new(DiscoveryService::new(
            ctx,
            config.discovery.clone(),
            config.ipv4,
            config.ipv6,
            codec,
            graph.clone() as Arc<dyn PeerLookup>,
            policy,
            connectivity.clone() as Arc<dyn Dialer>,
            metrics.clone(),
        ));
        let sockets = Arc::new(VirtualSocketManager::new(sessions.clone(), config.channel_size));

        Ok(Self {
            config,
            graph,
            sessions,
            connectivity,
            discovery,
            sockets,
            metrics,
            inputs: Mutex::new(Some((lost_rx, sockets_rx))),
            socket_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the network service
    pub async fn start(&self) -> Result<()> {
        let (lost_rx, sockets_rx) = self
            .inputs
            .lock()
            .take()
            .ok_or_else(|| NetworkError::ConfigError("network service already started".to_string()))?;

        tracing::info!(
            "Starting network service for {} in domain {}",
            self.config.local_id,
            self.config.domain
        );

        let handle = tokio::spawn(self.sockets.clone().run(sockets_rx, self.cancel.clone()));
        *self.socket_task.lock() = Some(handle);

        self.connectivity.start(lost_rx).await?;

        if self.config.discovery.enabled {
            let receivers = self.discovery.start();
            tracing::info!("Discovery started with {} receivers", receivers);
        }

        tracing::info!("Network service started successfully");
        Ok(())
    }

    /// Stop every background task and close all connections
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down network service");
        self.cancel.cancel();
        self.discovery.shutdown().await;
        self.connectivity.shutdown().await;
        self.sessions.close_all();

        let handle = self.socket_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Virtual socket dispatcher ended abnormally: {}", e);
            }
        }
    }

    /// Get a network client
    pub fn client(&self) -> NetworkClient {
        NetworkClient::new(self.sessions.clone(), self.sockets.clone())
    }

    /// Add an outbound connection task with the default retry policy
    pub fn connect(&self, endpoint: SocketAddr) -> Result<TaskId> {
        self.connect_with(ConnectTaskConfig::new(endpoint))
    }

    /// Add an outbound connection task
    pub fn connect_with(&self, task: ConnectTaskConfig) -> Result<TaskId> {
        self.connectivity.add_task(task)
    }

    /// Endpoints the local peer listens on
    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.connectivity.listeners()
    }

    /// Raise or clear a reachability block on `peer` across the overlay
    pub fn set_reachability(&self, peer: &str, blocked: bool) -> bool {
        self.sessions.set_reachability(peer, blocked)
    }

    /// Send one discovery announcement now
    pub async fn announce(&self) -> Result<usize> {
        self.discovery.announce().await
    }

    pub fn local_id(&self) -> &str {
        &self.config.local_id
    }

    pub fn graph(&self) -> &Arc<PeerGraph> {
        &self.graph
    }

    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::graph::SameDomainPolicy;

    fn loopback_config(id: &str) -> TerraGrafConfig {
        let mut config = TerraGrafConfig::for_peer(id, "lab");
        config.listeners = ListenerConfig::Manual {
            endpoints: vec!["127.0.0.1:0".parse().unwrap()],
        };
        config.discovery.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_network_service_creation() {
        let (event_tx, _event_rx) = mpsc::channel(100);
        let service =
            NetworkService::new(loopback_config("test-node"), Arc::new(SameDomainPolicy), event_tx)
                .unwrap();
        let client = service.client();

        assert_eq!(client.peer_count().await, 0);
        assert_eq!(service.local_id(), "test-node");
        assert!(client.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (event_tx, _event_rx) = mpsc::channel(100);
        let config = TerraGrafConfig::for_peer("", "lab");
        assert!(NetworkService::new(config, Arc::new(SameDomainPolicy), event_tx).is_err());
    }

    #[tokio::test]
    async fn test_gateway_mapper_follows_nat_flag() {
        let (event_tx, _event_rx) = mpsc::channel(100);
        let service = NetworkService::new(
            loopback_config("plain"),
            Arc::new(SameDomainPolicy),
            event_tx.clone(),
        )
        .unwrap();
        assert!(!service.connectivity.maps_nat());

        let mut config = loopback_config("mapped");
        config.nat.enabled = true;
        let service = NetworkService::new(config, Arc::new(SameDomainPolicy), event_tx).unwrap();
        assert!(service.connectivity.maps_nat());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (event_tx, _event_rx) = mpsc::channel(100);
        let service =
            NetworkService::new(loopback_config("node"), Arc::new(SameDomainPolicy), event_tx)
                .unwrap();
        service.start().await.unwrap();
        assert_eq!(service.local_endpoints().len(), 1);
        assert!(service.start().await.is_err());
        service.shutdown().await;
    }
}
