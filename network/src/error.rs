// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network error types

use thiserror::Error;

/// Network result type
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Network error types
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connect attempt refused or reset
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Peer not found in the graph
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Negotiation refused by version or isolation policy
    #[error("Negotiation rejected by {peer}: {reason}")]
    NegotiationRejected { peer: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Invalid message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A port of zero was supplied where a real port is required
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// A required peer id was empty
    #[error("Missing required id: {0}")]
    MissingId(&'static str),

    /// Socket id outside `>= 1` and not the unassigned marker
    #[error("Invalid socket id: {0}")]
    InvalidSocketId(i64),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSendError,

    /// Not connected
    #[error("Not connected to peer: {0}")]
    NotConnected(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// NAT gateway error
    #[error("NAT error: {0}")]
    NatError(String),

    /// Service is shutting down
    #[error("Network shutdown")]
    Shutdown,
}

impl NetworkError {
    /// Whether the failure is a link-level error that heals on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::IoError(_)
                | NetworkError::ConnectionError(_)
                | NetworkError::TimeoutError(_)
                | NetworkError::TransportError(_)
        )
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::SerializationError(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for NetworkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        NetworkError::ChannelSendError
    }
}
