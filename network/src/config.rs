// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the TerraGraf overlay
//!
//! Values arrive already resolved; this module only models and checks them.

use crate::constants::*;
use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Top-level overlay configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerraGrafConfig {
    /// Local peer id
    pub local_id: String,

    /// Isolation domain of the local peer
    pub domain: String,

    /// Enable IPv4 listeners and discovery
    pub ipv4: bool,

    /// Enable IPv6 listeners and discovery
    pub ipv6: bool,

    /// Local TCP listeners
    pub listeners: ListenerConfig,

    /// NAT port mapping
    pub nat: NatConfig,

    /// UDP discovery
    pub discovery: DiscoveryConfig,

    /// Outbound connection tasks
    pub connect_tasks: Vec<ConnectTaskConfig>,

    /// Options applied to every TCP stream
    pub socket: SocketOptions,

    /// Session layer settings
    pub session: SessionConfig,

    /// Maximum frame size for messages, at most `MAX_FRAME_SIZE`
    pub max_frame_size: usize,

    /// Sockets queued per virtual-socket listener before opens are refused
    pub channel_size: usize,
}

impl Default for TerraGrafConfig {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            domain: "default".to_string(),
            ipv4: true,
            ipv6: false,
            listeners: ListenerConfig::default(),
            nat: NatConfig::default(),
            discovery: DiscoveryConfig::default(),
            connect_tasks: Vec::new(),
            socket: SocketOptions::default(),
            session: SessionConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
            channel_size: CHANNEL_SIZE,
        }
    }
}

impl TerraGrafConfig {
    /// Config for a peer id, everything else defaulted
    pub fn for_peer(local_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Reject contradictory or incomplete values
    pub fn validate(&self) -> Result<()> {
        if self.local_id.is_empty() {
            return Err(NetworkError::MissingId("local peer id"));
        }
        if !self.ipv4 && !self.ipv6 {
            return Err(NetworkError::ConfigError(
                "at least one address family must be enabled".to_string(),
            ));
        }
        if let ListenerConfig::Manual { endpoints } = &self.listeners {
            if endpoints.is_empty() {
                return Err(NetworkError::ConfigError(
                    "manual listener mode needs at least one endpoint".to_string(),
                ));
            }
        }
        if self.discovery.enabled {
            if self.discovery.ports.is_empty() {
                return Err(NetworkError::ConfigError(
                    "discovery is enabled without ports".to_string(),
                ));
            }
            if let Some(port) = self.discovery.ports.iter().find(|p| **p == 0) {
                return Err(NetworkError::InvalidPort(*port));
            }
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE {
            return Err(NetworkError::ConfigError(format!(
                "max frame size {} outside 1..={}",
                self.max_frame_size, MAX_FRAME_SIZE
            )));
        }
        if self.channel_size == 0 {
            return Err(NetworkError::ConfigError(
                "channel size must be positive".to_string(),
            ));
        }
        for task in &self.connect_tasks {
            task.validate()?;
        }
        Ok(())
    }
}

/// Which local endpoints accept TCP connections
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerConfig {
    /// One listener per usable local interface on the given port
    Automatic { port: u16 },
    /// Listen on exactly these endpoints; wildcard addresses expand to
    /// every local interface plus loopback
    Manual { endpoints: Vec<SocketAddr> },
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig::Automatic {
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

/// NAT port-mapping configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NatConfig {
    /// Request a mapping on the gateway
    pub enabled: bool,

    /// Endpoint used to find which local address faces the gateway
    pub probe_addr: Option<SocketAddr>,
}

/// Discovery transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMode {
    Multicast,
    Broadcast,
}

/// UDP discovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub mode: DiscoveryMode,
    pub multicast_v4: Ipv4Addr,
    pub multicast_v6: Ipv6Addr,
    pub broadcast_addr: Ipv4Addr,
    pub ports: Vec<u16>,
    /// Interval between announcements
    pub announce_interval: Duration,
    /// Bound on connects to announced endpoints
    pub connect_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: DiscoveryMode::Multicast,
            multicast_v4: DEFAULT_MULTICAST_V4,
            multicast_v6: DEFAULT_MULTICAST_V6,
            broadcast_addr: Ipv4Addr::BROADCAST,
            ports: vec![DEFAULT_DISCOVERY_PORT],
            announce_interval: DISCOVERY_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Retry policy of an outbound connection task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Queue the task again after a failure or a dropped connection
    pub reconnect_on_failure: bool,

    /// Delay before the next attempt
    pub delay: Duration,

    /// Bound on a single connect
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_on_failure: true,
            delay: RECONNECT_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn once(connect_timeout: Duration) -> Self {
        Self {
            reconnect_on_failure: false,
            delay: Duration::ZERO,
            connect_timeout,
        }
    }
}

/// A configured outbound connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTaskConfig {
    pub endpoint: SocketAddr,
    pub retry: RetryPolicy,
    /// Close an existing session with the same peer when this one connects
    pub close_duplicate_session: bool,
}

impl ConnectTaskConfig {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            retry: RetryPolicy::default(),
            close_duplicate_session: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.port() == 0 {
            return Err(NetworkError::InvalidPort(0));
        }
        Ok(())
    }
}

/// Options applied to TCP streams
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_buffer_size: Some(SOCKET_BUFFER_SIZE),
            recv_buffer_size: Some(SOCKET_BUFFER_SIZE),
            no_delay: true,
        }
    }
}

/// Session layer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on the negotiation exchange
    pub negotiation_timeout: Duration,

    /// Keep several physical connections per peer
    pub allow_multiple_connections: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            allow_multiple_connections: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TerraGrafConfig::default();
        assert!(config.ipv4);
        assert!(!config.ipv6);
        assert_eq!(config.discovery.ports, vec![DEFAULT_DISCOVERY_PORT]);
        assert_eq!(config.discovery.mode, DiscoveryMode::Multicast);
        // local id is mandatory
        assert!(config.validate().is_err());
        assert!(TerraGrafConfig::for_peer("node-a", "lab").validate().is_ok());
    }

    #[test]
    fn test_connect_task_port_checked() {
        let mut config = TerraGrafConfig::for_peer("node-a", "lab");
        config
            .connect_tasks
            .push(ConnectTaskConfig::new("10.0.0.2:0".parse().unwrap()));
        assert!(matches!(config.validate(), Err(NetworkError::InvalidPort(0))));
    }

    #[test]
    fn test_address_family_required() {
        let mut config = TerraGrafConfig::for_peer("node-a", "lab");
        config.ipv4 = false;
        assert!(matches!(config.validate(), Err(NetworkError::ConfigError(_))));
    }

    #[test]
    fn test_frame_size_bounded() {
        let mut config = TerraGrafConfig::for_peer("node-a", "lab");
        config.max_frame_size = MAX_FRAME_SIZE + 1;
        assert!(matches!(config.validate(), Err(NetworkError::ConfigError(_))));
        config.max_frame_size = 0;
        assert!(config.validate().is_err());
        config.max_frame_size = 64 * 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_channel_size_rejected() {
        let mut config = TerraGrafConfig::for_peer("node-a", "lab");
        config.channel_size = 0;
        assert!(matches!(config.validate(), Err(NetworkError::ConfigError(_))));
    }

    #[test]
    fn test_manual_listeners_must_be_listed() {
        let mut config = TerraGrafConfig::for_peer("node-a", "lab");
        config.listeners = ListenerConfig::Manual { endpoints: vec![] };
        assert!(config.validate().is_err());
    }
}
