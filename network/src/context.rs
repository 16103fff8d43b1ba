// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide network context
//!
//! Holds the local identity and the message-id counter. Built once at
//! startup and shared by `Arc` with every component that creates messages.

use crate::constants::UNSPECIFIED_SENDER;
use crate::error::{NetworkError, Result};
use crate::protocols::{
    DiscoveryAnnouncement, Message, MessageBody, MessageId, Negotiation, PeerId, Priority,
    Routing, TransportMode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local identity and message-id source
#[derive(Debug)]
pub struct NetworkContext {
    local_id: PeerId,
    domain: String,
    next_message_id: AtomicU64,
}

impl NetworkContext {
    /// Create a context, seeding message ids from the wall clock in nanoseconds
    pub fn new(local_id: impl Into<PeerId>, domain: impl Into<String>) -> Result<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::with_seed(local_id, domain, seed)
    }

    /// Create a context with an explicit first message id
    pub fn with_seed(
        local_id: impl Into<PeerId>,
        domain: impl Into<String>,
        seed: MessageId,
    ) -> Result<Self> {
        let local_id = local_id.into();
        if local_id.is_empty() {
            return Err(NetworkError::MissingId("local peer id"));
        }
        if local_id == UNSPECIFIED_SENDER {
            return Err(NetworkError::ConfigError(format!(
                "'{}' is reserved and cannot be a peer id",
                UNSPECIFIED_SENDER
            )));
        }
        Ok(Self {
            local_id,
            domain: domain.into(),
            next_message_id: AtomicU64::new(seed),
        })
    }

    /// Local peer id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Local isolation domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Take the next message id
    pub fn next_message_id(&self) -> MessageId {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a routed message originated locally
    pub fn routed(
        &self,
        target_id: impl Into<PeerId>,
        priority: Priority,
        mode: TransportMode,
        body: MessageBody,
    ) -> Result<Message> {
        Message::new(
            self.local_id.clone(),
            self.next_message_id(),
            Some(Routing::new(target_id, priority, mode)),
            body,
        )
    }

    /// Acknowledge a reliable message back to its sender
    pub fn acknowledge(&self, target_id: impl Into<PeerId>, acknowledged_id: MessageId) -> Result<Message> {
        self.routed(
            target_id,
            Priority::High,
            TransportMode::BestEffort,
            MessageBody::Acknowledge { acknowledged_id },
        )
    }

    /// Frame-level acknowledgement, sent without naming the sender
    pub fn low_level_acknowledge(&self, acknowledged_id: MessageId) -> Result<Message> {
        Message::new(
            UNSPECIFIED_SENDER,
            self.next_message_id(),
            None,
            MessageBody::LowLevelAcknowledge { acknowledged_id },
        )
    }

    /// Negotiation message opening a connection
    pub fn negotiation(&self, negotiation: Negotiation) -> Result<Message> {
        Message::new(
            self.local_id.clone(),
            self.next_message_id(),
            None,
            MessageBody::Negotiation(negotiation),
        )
    }

    /// Discovery announcement datagram
    pub fn discovery(&self, announcement: DiscoveryAnnouncement) -> Result<Message> {
        Message::new(
            self.local_id.clone(),
            self.next_message_id(),
            None,
            MessageBody::Discovery(announcement),
        )
    }
}
