// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual-socket control and data payloads

use crate::constants::UNASSIGNED_SOCKET;
use crate::error::{NetworkError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Socket ids and ports on both ends of a virtual socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddressing {
    pub sender_socket: i64,
    pub target_socket: i64,
    pub sender_port: u16,
    pub target_port: u16,
}

impl SocketAddressing {
    pub fn new(sender_socket: i64, target_socket: i64, sender_port: u16, target_port: u16) -> Self {
        Self {
            sender_socket,
            target_socket,
            sender_port,
            target_port,
        }
    }

    /// Ids must be `>= 1` or the unassigned marker, ports non-zero
    pub fn validate(&self) -> Result<()> {
        for id in [self.sender_socket, self.target_socket] {
            if id < 1 && id != UNASSIGNED_SOCKET {
                return Err(NetworkError::InvalidSocketId(id));
            }
        }
        for port in [self.sender_port, self.target_port] {
            if port == 0 {
                return Err(NetworkError::InvalidPort(port));
            }
        }
        Ok(())
    }

    /// The same socket seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            sender_socket: self.target_socket,
            target_socket: self.sender_socket,
            sender_port: self.target_port,
            target_port: self.sender_port,
        }
    }
}

/// Application data on a virtual socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketRawData {
    pub socket: SocketAddressing,
    /// Per-socket increasing number used to restore order across relays
    pub packet_order: u64,
    pub data: Bytes,
}

impl SocketRawData {
    pub fn new(socket: SocketAddressing, packet_order: u64, data: Bytes) -> Self {
        Self {
            socket,
            packet_order,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_swaps_ends() {
        let socket = SocketAddressing::new(3, 9, 50000, 80);
        let back = socket.reversed();
        assert_eq!(back.sender_socket, 9);
        assert_eq!(back.target_socket, 3);
        assert_eq!(back.sender_port, 80);
        assert_eq!(back.target_port, 50000);
    }

    #[test]
    fn test_unassigned_socket_is_valid() {
        assert!(SocketAddressing::new(1, UNASSIGNED_SOCKET, 1, 1).validate().is_ok());
        assert!(SocketAddressing::new(-2, 1, 1, 1).validate().is_err());
    }
}
