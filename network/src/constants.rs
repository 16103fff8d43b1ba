// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network constants

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Default maximum frame size (8MB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Largest discovery datagram we read
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Default channel buffer size
pub const CHANNEL_SIZE: usize = 1024;

/// Default connect timeout for outbound tasks
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default negotiation timeout
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between discovery announcements
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Default TCP listener port
pub const DEFAULT_LISTEN_PORT: u16 = 5000;

/// Default discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 9000;

/// Default IPv4 multicast group for discovery
pub const DEFAULT_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// Default IPv6 multicast group for discovery (site-local scope)
pub const DEFAULT_MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x4299);

/// Default socket buffer size
pub const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// First port handed out to outbound virtual sockets
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Sender id of a frame-level acknowledgement whose origin is not tracked
pub const UNSPECIFIED_SENDER: &str = "*";

/// Marker for a virtual socket id that is not assigned yet
pub const UNASSIGNED_SOCKET: i64 = -1;

/// Network protocol version
pub const NETWORK_PROTOCOL_VERSION: u32 = 1;

/// Bound on the UPnP gateway search
pub const NAT_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Description attached to NAT port mappings we create
pub const NAT_MAPPING_DESCRIPTION: &str = "terragraf";
