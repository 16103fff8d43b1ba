// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! UDP discovery
//!
//! Peers announce their id, isolation domain and reachable endpoints by
//! multicast or broadcast datagrams. A receiver that has no direct
//! connection to the announcer dials it; the announcer never dials the
//! receiver, so a peer without listeners is only reached by peers it
//! announces itself to and that it dials on its own.

use crate::config::{DiscoveryConfig, DiscoveryMode};
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::context::NetworkContext;
use crate::counters::NetworkMetrics;
use crate::error::Result;
use crate::graph::{IsolationPolicy, PeerLookup};
use crate::protocols::wire::MessageCodec;
use crate::protocols::{DiscoveryAnnouncement, Message, MessageBody, PeerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens a single connection attempt and reports the negotiated peer id
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: SocketAddr) -> Result<PeerId>;
}

/// Discovery sender and receivers
pub struct DiscoveryService {
    ctx: Arc<NetworkContext>,
    config: DiscoveryConfig,
    ipv4: bool,
    ipv6: bool,
    codec: MessageCodec,
    peers: Arc<dyn PeerLookup>,
    policy: Arc<dyn IsolationPolicy>,
    dialer: Arc<dyn Dialer>,
    in_flight: Mutex<HashSet<PeerId>>,
    cancel: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    metrics: NetworkMetrics,
}

impl DiscoveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<NetworkContext>,
        config: DiscoveryConfig,
        ipv4: bool,
        ipv6: bool,
        codec: MessageCodec,
        peers: Arc<dyn PeerLookup>,
        policy: Arc<dyn IsolationPolicy>,
        dialer: Arc<dyn Dialer>,
        metrics: NetworkMetrics,
    ) -> Self {
        Self {
            ctx,
            config,
            ipv4,
            ipv6,
            codec,
            peers,
            policy,
            dialer,
            in_flight: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Bind the receivers and start periodic announcements
    ///
    /// Returns the number of receivers bound; a receiver that cannot be
    /// bound is logged and skipped.
    pub fn start(self: &Arc<Self>) -> usize {
        if !self.config.enabled {
            tracing::info!("Discovery disabled");
            return 0;
        }

        let mut handles = Vec::new();
        for port in &self.config.ports {
            for v6 in self.families() {
                match self.bind_receiver(v6, *port) {
                    Ok(socket) => {
                        tracing::info!(
                            "Discovery listening on port {} ({})",
                            port,
                            if v6 { "IPv6" } else { "IPv4" }
                        );
                        handles.push(tokio::spawn(self.clone().receive_loop(socket)));
                    }
                    Err(e) => tracing::warn!(
                        "Discovery receiver on port {} ({}) skipped: {}",
                        port,
                        if v6 { "IPv6" } else { "IPv4" },
                        e
                    ),
                }
            }
        }
        let bound = handles.len();

        handles.push(tokio::spawn(self.clone().announce_loop()));
        self.listeners.lock().extend(handles);
        bound
    }

    /// Stop every receiver and the announcement loop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.listeners.lock().drain(..).collect();
        futures::future::join_all(handles).await;
        tracing::info!("Discovery stopped");
    }

    fn families(&self) -> Vec<bool> {
        let mut families = Vec::new();
        if self.ipv4 {
            families.push(false);
        }
        if self.ipv6 {
            families.push(true);
        }
        families
    }

    fn announcement(&self) -> Result<Message> {
        let local = self.peers.local_peer();
        self.ctx.discovery(DiscoveryAnnouncement {
            domain: self.ctx.domain().to_string(),
            nat_endpoints: local.nat_endpoints,
            tcp_endpoints: local.listeners,
        })
    }

    /// Send one announcement to every configured target
    ///
    /// Returns the number of targets reached; failures are logged per
    /// target and do not stop the remaining ones.
    pub async fn announce(&self) -> Result<usize> {
        let datagram = self.codec.encode_datagram(&self.announcement()?)?;
        let mut sent = 0;

        for port in &self.config.ports {
            let port = *port;
            match self.config.mode {
                DiscoveryMode::Multicast => {
                    for v6 in self.families() {
                        let result = if v6 {
                            self.send_multicast_v6(&datagram, port).await
                        } else {
                            self.send_multicast_v4(&datagram, port).await
                        };
                        sent += self.count_send(result, port);
                    }
                }
                DiscoveryMode::Broadcast => {
                    if !self.ipv4 {
                        tracing::debug!("Broadcast discovery needs IPv4, skipping port {}", port);
                        continue;
                    }
                    let result = self.send_broadcast(&datagram, port).await;
                    sent += self.count_send(result, port);
                }
            }
        }
        Ok(sent)
    }

    fn count_send(&self, result: Result<SocketAddr>, port: u16) -> usize {
        match result {
            Ok(target) => {
                self.metrics.inc_datagrams_sent();
                tracing::trace!("Discovery datagram sent to {}", target);
                1
            }
            Err(e) => {
                self.metrics.inc_datagram_errors();
                tracing::warn!("Discovery datagram on port {} failed: {}", port, e);
                0
            }
        }
    }

    async fn send_multicast_v4(&self, datagram: &[u8], port: u16) -> Result<SocketAddr> {
        let group = self.config.multicast_v4;
        let target = SocketAddr::from((group, port));
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        let result = socket.send_to(datagram, target).await;
        let _ = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED);
        result?;
        Ok(target)
    }

    async fn send_multicast_v6(&self, datagram: &[u8], port: u16) -> Result<SocketAddr> {
        let group = self.config.multicast_v6;
        let target = SocketAddr::from((group, port));
        let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await?;
        socket.join_multicast_v6(&group, 0)?;
        let result = socket.send_to(datagram, target).await;
        let _ = socket.leave_multicast_v6(&group, 0);
        result?;
        Ok(target)
    }

    async fn send_broadcast(&self, datagram: &[u8], port: u16) -> Result<SocketAddr> {
        let target = SocketAddr::from((self.config.broadcast_addr, port));
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket.send_to(datagram, target).await?;
        Ok(target)
    }

    fn bind_receiver(&self, v6: bool, port: u16) -> Result<UdpSocket> {
        let (domain, addr) = if v6 {
            (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))
        } else {
            (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        if v6 {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())?;

        match self.config.mode {
            DiscoveryMode::Multicast if v6 => {
                socket.join_multicast_v6(&self.config.multicast_v6, 0)?
            }
            DiscoveryMode::Multicast => {
                socket.join_multicast_v4(&self.config.multicast_v4, &Ipv4Addr::UNSPECIFIED)?
            }
            DiscoveryMode::Broadcast => socket.set_broadcast(true)?,
        }

        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn receive_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => {
                    self.metrics.inc_datagrams_received();
                    self.handle_datagram(&buf[..len], from);
                }
                Err(e) => {
                    self.metrics.inc_datagram_errors();
                    tracing::warn!("Discovery receive failed: {}", e);
                }
            }
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        if self.config.announce_interval.is_zero() {
            if let Err(e) = self.announce().await {
                tracing::warn!("Discovery announcement failed: {}", e);
            }
            return;
        }

        let mut interval = tokio::time::interval(self.config.announce_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.announce().await {
                        tracing::warn!("Discovery announcement failed: {}", e);
                    }
                }
            }
        }
    }

    /// Decode and act on one datagram
    pub fn handle_datagram(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) -> Option<JoinHandle<()>> {
        let message = match self.codec.decode_datagram(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Undecodable discovery datagram from {}: {}", from, e);
                return None;
            }
        };
        match &message.body {
            MessageBody::Discovery(announcement) => {
                self.handle_announcement(&message.sender_id, announcement)
            }
            other => {
                tracing::debug!("Ignoring {:?} datagram from {}", other.code(), from);
                None
            }
        }
    }

    /// Dial an announcing peer unless it is ourselves, refused by policy,
    /// already direct, already being dialed, or offers no endpoint
    pub fn handle_announcement(
        self: &Arc<Self>,
        sender: &str,
        announcement: &DiscoveryAnnouncement,
    ) -> Option<JoinHandle<()>> {
        if sender == self.ctx.local_id() {
            return None;
        }
        if !self.policy.is_allowed(self.ctx.domain(), &announcement.domain) {
            tracing::debug!(
                "Announcement from {} in domain '{}' refused by isolation policy",
                sender,
                announcement.domain
            );
            return None;
        }
        if self.peers.lookup(sender) == Some(1) {
            tracing::trace!("Already connected to {}", sender);
            return None;
        }
        if announcement.tcp_endpoints.is_empty() && announcement.nat_endpoints.is_empty() {
            tracing::debug!("{} announces no reachable endpoint", sender);
            return None;
        }
        if !self.in_flight.lock().insert(sender.to_string()) {
            tracing::trace!("Dial of {} already in flight", sender);
            return None;
        }

        let service = self.clone();
        let sender = sender.to_string();
        let announcement = announcement.clone();
        Some(tokio::spawn(async move {
            if !service.dial_announced(&sender, &announcement).await {
                tracing::debug!("Discovered peer {} could not be reached", sender);
            }
            service.in_flight.lock().remove(&sender);
        }))
    }

    async fn dial_announced(&self, sender: &str, announcement: &DiscoveryAnnouncement) -> bool {
        let rounds = [
            ("direct", &announcement.tcp_endpoints),
            ("NAT", &announcement.nat_endpoints),
        ];
        for (kind, endpoints) in rounds {
            for endpoint in endpoints.iter() {
                match self.dialer.dial(*endpoint).await {
                    Ok(id) if id == sender => {
                        tracing::info!("Connected to discovered peer {} at {}", sender, endpoint);
                        return true;
                    }
                    Ok(id) => tracing::debug!(
                        "{} endpoint {} answered as {} instead of {}",
                        kind,
                        endpoint,
                        id,
                        sender
                    ),
                    Err(e) => tracing::debug!("Dial of {} endpoint {} failed: {}", kind, endpoint, e),
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::graph::{OpenPolicy, PeerGraph, SameDomainPolicy};
    use crate::peer::PeerInfo;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDialer {
        attempts: Mutex<Vec<SocketAddr>>,
        answers: HashMap<SocketAddr, PeerId>,
        delay: Duration,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, endpoint: SocketAddr) -> Result<PeerId> {
            self.attempts.lock().push(endpoint);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.answers
                .get(&endpoint)
                .cloned()
                .ok_or_else(|| NetworkError::ConnectionError(format!("{} refused", endpoint)))
        }
    }

    fn service(
        graph: Arc<PeerGraph>,
        policy: Arc<dyn IsolationPolicy>,
        dialer: Arc<RecordingDialer>,
    ) -> Arc<DiscoveryService> {
        let ctx = Arc::new(NetworkContext::new("p1", "lab").unwrap());
        Arc::new(DiscoveryService::new(
            ctx,
            DiscoveryConfig::default(),
            true,
            false,
            MessageCodec::default(),
            graph,
            policy,
            dialer,
            NetworkMetrics::new(),
        ))
    }

    fn graph() -> Arc<PeerGraph> {
        Arc::new(PeerGraph::new(PeerInfo::new("p1", "lab")))
    }

    fn announcement(tcp: &[&str], nat: &[&str]) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            domain: "lab".into(),
            tcp_endpoints: tcp.iter().map(|e| e.parse().unwrap()).collect(),
            nat_endpoints: nat.iter().map(|e| e.parse().unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_from_direct_peer_dials_nothing() {
        let graph = graph();
        graph.add_direct("p2", "lab");
        let dialer = Arc::new(RecordingDialer::default());
        let discovery = service(graph, Arc::new(SameDomainPolicy), dialer.clone());

        let ann = announcement(&["10.0.0.2:5000"], &[]);
        assert!(discovery.handle_announcement("p2", &ann).is_none());
        assert!(discovery.handle_announcement("p2", &ann).is_none());
        assert!(dialer.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_broadcaster_without_listeners_is_not_dialed() {
        let dialer = Arc::new(RecordingDialer::default());
        let discovery = service(graph(), Arc::new(SameDomainPolicy), dialer.clone());

        let ann = announcement(&[], &[]);
        assert!(discovery.handle_announcement("p2", &ann).is_none());
        assert!(dialer.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_own_and_foreign_domain_announcements_dropped() {
        let dialer = Arc::new(RecordingDialer::default());
        let discovery = service(graph(), Arc::new(SameDomainPolicy), dialer.clone());

        let ann = announcement(&["10.0.0.2:5000"], &[]);
        assert!(discovery.handle_announcement("p1", &ann).is_none());

        let mut foreign = ann.clone();
        foreign.domain = "prod".into();
        assert!(discovery.handle_announcement("p2", &foreign).is_none());
        assert!(dialer.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dials_in_order_until_id_matches() {
        let mut answers = HashMap::new();
        answers.insert("10.0.0.3:5000".parse().unwrap(), "someone-else".to_string());
        answers.insert("10.0.0.4:5000".parse().unwrap(), "p2".to_string());
        let dialer = Arc::new(RecordingDialer {
            answers,
            ..Default::default()
        });
        let discovery = service(graph(), Arc::new(OpenPolicy), dialer.clone());

        let ann = announcement(
            &["10.0.0.2:5000", "10.0.0.3:5000", "10.0.0.4:5000", "10.0.0.5:5000"],
            &["203.0.113.9:40000"],
        );
        discovery.handle_announcement("p2", &ann).unwrap().await.unwrap();

        let attempts = dialer.attempts.lock().clone();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2], "10.0.0.4:5000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_nat_endpoints_tried_after_direct_ones() {
        let mut answers = HashMap::new();
        answers.insert("203.0.113.9:40000".parse().unwrap(), "p2".to_string());
        let dialer = Arc::new(RecordingDialer {
            answers,
            ..Default::default()
        });
        let discovery = service(graph(), Arc::new(OpenPolicy), dialer.clone());

        let ann = announcement(&["10.0.0.2:5000"], &["203.0.113.9:40000"]);
        discovery.handle_announcement("p2", &ann).unwrap().await.unwrap();

        let attempts = dialer.attempts.lock().clone();
        let expected: Vec<SocketAddr> = vec![
            "10.0.0.2:5000".parse().unwrap(),
            "203.0.113.9:40000".parse().unwrap(),
        ];
        assert_eq!(attempts, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_announcements_dial_once() {
        let dialer = Arc::new(RecordingDialer {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let discovery = service(graph(), Arc::new(OpenPolicy), dialer.clone());

        let ann = announcement(&["10.0.0.2:5000"], &[]);
        let first = discovery.handle_announcement("p2", &ann).unwrap();
        assert!(discovery.handle_announcement("p2", &ann).is_none());
        first.await.unwrap();

        assert_eq!(dialer.attempts.lock().len(), 1);
        // the next announcement dials again once the first attempt ended
        discovery.handle_announcement("p2", &ann).unwrap().await.unwrap();
        assert_eq!(dialer.attempts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_datagram_decoded_into_announcement() {
        let mut answers = HashMap::new();
        answers.insert("10.0.0.2:5000".parse().unwrap(), "p2".to_string());
        let dialer = Arc::new(RecordingDialer {
            answers,
            ..Default::default()
        });
        let discovery = service(graph(), Arc::new(OpenPolicy), dialer.clone());

        let remote = NetworkContext::new("p2", "lab").unwrap();
        let datagram = MessageCodec::default()
            .encode_datagram(
                &remote
                    .discovery(announcement(&["10.0.0.2:5000"], &[]))
                    .unwrap(),
            )
            .unwrap();
        let from: SocketAddr = "10.0.0.2:9000".parse().unwrap();
        discovery
            .handle_datagram(&datagram, from)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(dialer.attempts.lock().len(), 1);

        assert!(discovery.handle_datagram(b"garbage", from).is_none());
    }

    #[tokio::test]
    async fn test_announcement_carries_local_endpoints() {
        let graph = graph();
        graph.set_local_listeners(vec!["10.0.0.1:5000".parse().unwrap()]);
        let discovery = service(graph, Arc::new(OpenPolicy), Arc::new(RecordingDialer::default()));

        let message = discovery.announcement().unwrap();
        assert!(message.target_id().is_none());
        match message.body {
            MessageBody::Discovery(ann) => {
                assert_eq!(ann.domain, "lab");
                assert_eq!(ann.tcp_endpoints.len(), 1);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
