// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network protocols and message types
//!
//! Every message carries a sender id, a process-unique increasing message id
//! and a body whose variant is the message code. Routed kinds additionally
//! carry a [`Routing`] header (target, priority, transport mode). Link-level
//! kinds (negotiation, frame acknowledgement, discovery) never do.

use crate::constants::UNASSIGNED_SOCKET;
use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub mod socket;
pub mod topology;
pub mod wire;

pub use socket::{SocketAddressing, SocketRawData};
pub use topology::{PeerDescriptor, PeerUpdate, Relation, TopologyInformation};
pub use wire::{Negotiation, NegotiationVerdict};

/// Peer identifier
pub type PeerId = String;

/// Message identifier, unique and increasing per sending process
pub type MessageId = u64;

/// Message code, the explicit kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageCode {
    Acknowledge = 1,
    LowLevelAcknowledge = 2,
    Negotiation = 3,
    SocketOpenRequest = 4,
    SocketOpenResponse = 5,
    SocketClose = 6,
    SocketRawData = 7,
    TopologyInformation = 8,
    PeerUpdate = 9,
    Discovery = 10,
}

impl MessageCode {
    /// Convert to byte
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageCode::Acknowledge),
            2 => Some(MessageCode::LowLevelAcknowledge),
            3 => Some(MessageCode::Negotiation),
            4 => Some(MessageCode::SocketOpenRequest),
            5 => Some(MessageCode::SocketOpenResponse),
            6 => Some(MessageCode::SocketClose),
            7 => Some(MessageCode::SocketRawData),
            8 => Some(MessageCode::TopologyInformation),
            9 => Some(MessageCode::PeerUpdate),
            10 => Some(MessageCode::Discovery),
            _ => None,
        }
    }

    /// Whether messages of this kind travel with a routing header
    pub fn is_routed(&self) -> bool {
        !matches!(
            self,
            MessageCode::LowLevelAcknowledge | MessageCode::Negotiation | MessageCode::Discovery
        )
    }
}

/// Send priority of a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Transport mode of a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// Acknowledged end to end, ordered on a single physical connection
    ReliableOrdered,
    /// Fire and forget
    BestEffort,
}

/// Routing header of a routed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub target_id: PeerId,
    pub priority: Priority,
    pub mode: TransportMode,
}

impl Routing {
    pub fn new(target_id: impl Into<PeerId>, priority: Priority, mode: TransportMode) -> Self {
        Self {
            target_id: target_id.into(),
            priority,
            mode,
        }
    }
}

/// Peer announcement carried by discovery datagrams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    /// Isolation domain of the announcing peer
    pub domain: String,
    /// Endpoints mapped on the announcer's NAT gateway
    pub nat_endpoints: Vec<SocketAddr>,
    /// Endpoints the announcer accepts TCP connections on
    pub tcp_endpoints: Vec<SocketAddr>,
}

/// Message body, one variant per message code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Confirms receipt of a reliable-mode message at its target
    Acknowledge { acknowledged_id: MessageId },
    /// Confirms receipt of a frame on one physical connection
    LowLevelAcknowledge { acknowledged_id: MessageId },
    Negotiation(Negotiation),
    SocketOpenRequest(SocketAddressing),
    SocketOpenResponse(SocketAddressing),
    SocketClose(SocketAddressing),
    SocketRawData(SocketRawData),
    TopologyInformation(TopologyInformation),
    PeerUpdate(PeerUpdate),
    Discovery(DiscoveryAnnouncement),
}

impl MessageBody {
    /// Message code of this body
    pub fn code(&self) -> MessageCode {
        match self {
            MessageBody::Acknowledge { .. } => MessageCode::Acknowledge,
            MessageBody::LowLevelAcknowledge { .. } => MessageCode::LowLevelAcknowledge,
            MessageBody::Negotiation(_) => MessageCode::Negotiation,
            MessageBody::SocketOpenRequest(_) => MessageCode::SocketOpenRequest,
            MessageBody::SocketOpenResponse(_) => MessageCode::SocketOpenResponse,
            MessageBody::SocketClose(_) => MessageCode::SocketClose,
            MessageBody::SocketRawData(_) => MessageCode::SocketRawData,
            MessageBody::TopologyInformation(_) => MessageCode::TopologyInformation,
            MessageBody::PeerUpdate(_) => MessageCode::PeerUpdate,
            MessageBody::Discovery(_) => MessageCode::Discovery,
        }
    }

    fn socket_addressing(&self) -> Option<&SocketAddressing> {
        match self {
            MessageBody::SocketOpenRequest(s)
            | MessageBody::SocketOpenResponse(s)
            | MessageBody::SocketClose(s) => Some(s),
            MessageBody::SocketRawData(d) => Some(&d.socket),
            _ => None,
        }
    }
}

/// Wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: PeerId,
    pub message_id: MessageId,
    pub routing: Option<Routing>,
    pub body: MessageBody,
}

impl Message {
    /// Build a message, rejecting contract violations up front
    pub fn new(
        sender_id: impl Into<PeerId>,
        message_id: MessageId,
        routing: Option<Routing>,
        body: MessageBody,
    ) -> Result<Self> {
        let message = Self {
            sender_id: sender_id.into(),
            message_id,
            routing,
            body,
        };
        message.validate()?;
        Ok(message)
    }

    /// Check the structural invariants of the message
    pub fn validate(&self) -> Result<()> {
        if self.sender_id.is_empty() {
            return Err(NetworkError::MissingId("sender id"));
        }

        let code = self.code();
        match (&self.routing, code.is_routed()) {
            (Some(routing), true) if routing.target_id.is_empty() => {
                return Err(NetworkError::MissingId("target id"));
            }
            (None, true) => return Err(NetworkError::MissingId("target id")),
            (Some(_), false) => {
                return Err(NetworkError::InvalidMessage(format!(
                    "{:?} must not carry a target",
                    code
                )));
            }
            _ => {}
        }

        if let Some(socket) = self.body.socket_addressing() {
            socket.validate()?;
            let both_assigned = matches!(
                self.body,
                MessageBody::SocketRawData(_) | MessageBody::SocketClose(_)
            );
            if both_assigned {
                if socket.sender_socket == UNASSIGNED_SOCKET {
                    return Err(NetworkError::InvalidSocketId(socket.sender_socket));
                }
                if socket.target_socket == UNASSIGNED_SOCKET {
                    return Err(NetworkError::InvalidSocketId(socket.target_socket));
                }
            }
        }

        Ok(())
    }

    /// Message code
    pub fn code(&self) -> MessageCode {
        self.body.code()
    }

    /// Target of a routed message
    pub fn target_id(&self) -> Option<&str> {
        self.routing.as_ref().map(|r| r.target_id.as_str())
    }

    /// Send priority; link-level kinds always go first
    pub fn priority(&self) -> Priority {
        match &self.routing {
            Some(routing) => routing.priority,
            None => match self.body {
                MessageBody::Discovery(_) => Priority::Normal,
                _ => Priority::High,
            },
        }
    }

    /// Whether the message expects an end-to-end acknowledgement
    pub fn is_reliable(&self) -> bool {
        matches!(
            self.routing,
            Some(Routing {
                mode: TransportMode::ReliableOrdered,
                ..
            })
        )
    }

    /// Serialized size of the message
    pub fn payload_size(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NETWORK_PROTOCOL_VERSION;

    fn routed(target: &str, body: MessageBody) -> Result<Message> {
        Message::new(
            "node-a",
            7,
            Some(Routing::new(target, Priority::Normal, TransportMode::ReliableOrdered)),
            body,
        )
    }

    #[test]
    fn test_message_code_conversion() {
        assert_eq!(MessageCode::Acknowledge.as_u8(), 1);
        assert_eq!(MessageCode::from_u8(10), Some(MessageCode::Discovery));
        assert_eq!(MessageCode::from_u8(0), None);
        assert_eq!(MessageCode::from_u8(255), None);
    }

    #[test]
    fn test_discovery_never_carries_target() {
        let body = MessageBody::Discovery(DiscoveryAnnouncement {
            domain: "lab".into(),
            nat_endpoints: vec![],
            tcp_endpoints: vec![],
        });
        assert!(Message::new("node-a", 1, None, body.clone()).is_ok());
        assert!(matches!(
            routed("node-b", body),
            Err(NetworkError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_routed_message_requires_target() {
        let body = MessageBody::Acknowledge { acknowledged_id: 3 };
        assert!(matches!(
            Message::new("node-a", 1, None, body.clone()),
            Err(NetworkError::MissingId("target id"))
        ));
        assert!(matches!(
            routed("", body.clone()),
            Err(NetworkError::MissingId("target id"))
        ));
        assert!(routed("node-b", body).is_ok());
    }

    #[test]
    fn test_missing_sender_rejected() {
        let body = MessageBody::Negotiation(Negotiation::new("lab"));
        assert!(matches!(
            Message::new("", 1, None, body),
            Err(NetworkError::MissingId("sender id"))
        ));
    }

    #[test]
    fn test_socket_contract_checked_at_construction() {
        let bad_port = SocketAddressing::new(1, UNASSIGNED_SOCKET, 0, 80);
        assert!(matches!(
            routed("node-b", MessageBody::SocketOpenRequest(bad_port)),
            Err(NetworkError::InvalidPort(0))
        ));

        let bad_id = SocketAddressing::new(0, UNASSIGNED_SOCKET, 1000, 80);
        assert!(matches!(
            routed("node-b", MessageBody::SocketOpenRequest(bad_id)),
            Err(NetworkError::InvalidSocketId(0))
        ));

        let unassigned_target = SocketAddressing::new(4, UNASSIGNED_SOCKET, 1000, 80);
        assert!(routed("node-b", MessageBody::SocketOpenRequest(unassigned_target)).is_ok());
        assert!(matches!(
            routed("node-b", MessageBody::SocketClose(unassigned_target)),
            Err(NetworkError::InvalidSocketId(-1))
        ));
    }

    #[test]
    fn test_priority_and_reliability() {
        let ack = Message::new(
            "node-a",
            2,
            Some(Routing::new("node-b", Priority::High, TransportMode::BestEffort)),
            MessageBody::Acknowledge { acknowledged_id: 1 },
        )
        .unwrap();
        assert_eq!(ack.priority(), Priority::High);
        assert!(!ack.is_reliable());

        let negotiation = Message::new(
            "node-a",
            3,
            None,
            MessageBody::Negotiation(Negotiation::new("lab")),
        )
        .unwrap();
        assert_eq!(negotiation.priority(), Priority::High);
        assert_eq!(negotiation.code(), MessageCode::Negotiation);
        match &negotiation.body {
            MessageBody::Negotiation(n) => assert_eq!(n.version, NETWORK_PROTOCOL_VERSION),
            other => panic!("unexpected body {:?}", other),
        }
    }
}
