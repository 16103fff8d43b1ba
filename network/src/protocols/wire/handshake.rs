// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Negotiation protocol run on every fresh physical connection

use super::codec::MessageCodec;
use crate::constants::NETWORK_PROTOCOL_VERSION;
use crate::context::NetworkContext;
use crate::error::{NetworkError, Result};
use crate::graph::IsolationPolicy;
use crate::protocols::{Message, MessageBody, PeerId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Negotiation payload exchanged right after connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    /// Isolation domain of the sender
    pub domain: String,

    /// Protocol version
    pub version: u32,
}

impl Negotiation {
    /// Create a negotiation payload for the current protocol version
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            version: NETWORK_PROTOCOL_VERSION,
        }
    }

    /// Check if the protocol versions can talk to each other
    pub fn is_compatible(&self, other: &Negotiation) -> bool {
        self.version == other.version
    }
}

/// Outcome of checking a remote negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationVerdict {
    Accepted,
    VersionMismatch { local: u32, remote: u32 },
    DomainRefused { local: String, remote: String },
}

/// Handshake handler
pub struct Handshake {
    local: Negotiation,
    policy: Arc<dyn IsolationPolicy>,
}

impl Handshake {
    /// Create a new handshake handler
    pub fn new(domain: impl Into<String>, policy: Arc<dyn IsolationPolicy>) -> Self {
        Self {
            local: Negotiation::new(domain),
            policy,
        }
    }

    /// Get the local negotiation payload
    pub fn local(&self) -> &Negotiation {
        &self.local
    }

    /// Judge a remote negotiation against version and isolation policy
    pub fn judge(&self, remote: &Negotiation) -> NegotiationVerdict {
        if !self.local.is_compatible(remote) {
            return NegotiationVerdict::VersionMismatch {
                local: self.local.version,
                remote: remote.version,
            };
        }
        if !self.policy.is_allowed(&self.local.domain, &remote.domain) {
            return NegotiationVerdict::DomainRefused {
                local: self.local.domain.clone(),
                remote: remote.domain.clone(),
            };
        }
        NegotiationVerdict::Accepted
    }

    /// Exchange negotiation messages over a framed stream
    ///
    /// Returns the remote peer id and its negotiation payload. Any mismatch,
    /// a non-negotiation first frame, an early close or the timeout all yield
    /// an error; the caller drops the stream in that case.
    pub async fn negotiate<S>(
        &self,
        ctx: &NetworkContext,
        framed: &mut Framed<S, MessageCodec>,
        timeout: Duration,
    ) -> Result<(PeerId, Negotiation)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            let hello = ctx.negotiation(self.local.clone())?;
            framed.send(hello).await?;

            let message: Message = framed.next().await.ok_or_else(|| {
                NetworkError::ConnectionError("stream closed during negotiation".to_string())
            })??;

            let remote = match message.body {
                MessageBody::Negotiation(negotiation) => negotiation,
                other => {
                    return Err(NetworkError::ProtocolError(format!(
                        "expected negotiation, got {:?}",
                        other.code()
                    )));
                }
            };

            if message.sender_id == ctx.local_id() {
                return Err(NetworkError::NegotiationRejected {
                    peer: message.sender_id,
                    reason: "connected to self".to_string(),
                });
            }

            match self.judge(&remote) {
                NegotiationVerdict::Accepted => Ok::<_, NetworkError>((message.sender_id, remote)),
                verdict => Err(NetworkError::NegotiationRejected {
                    peer: message.sender_id,
                    reason: format!("{:?}", verdict),
                }),
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| NetworkError::TimeoutError("negotiation timed out".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{OpenPolicy, SameDomainPolicy};

    #[test]
    fn test_negotiation_compatibility() {
        let a = Negotiation::new("lab");
        let mut b = Negotiation::new("lab");
        assert!(a.is_compatible(&b));

        b.version += 1;
        assert!(!a.is_compatible(&b));
    }

    #[test]
    fn test_judge_domain_policy() {
        let strict = Handshake::new("lab", Arc::new(SameDomainPolicy));
        assert_eq!(strict.judge(&Negotiation::new("lab")), NegotiationVerdict::Accepted);
        assert!(matches!(
            strict.judge(&Negotiation::new("prod")),
            NegotiationVerdict::DomainRefused { .. }
        ));

        let open = Handshake::new("lab", Arc::new(OpenPolicy));
        assert_eq!(open.judge(&Negotiation::new("prod")), NegotiationVerdict::Accepted);
    }

    #[tokio::test]
    async fn test_negotiate_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let ctx_a = NetworkContext::new("node-a", "lab").unwrap();
        let ctx_b = NetworkContext::new("node-b", "lab").unwrap();
        let hs_a = Handshake::new("lab", Arc::new(SameDomainPolicy));
        let hs_b = Handshake::new("lab", Arc::new(SameDomainPolicy));
        let mut fa = Framed::new(left, MessageCodec::default());
        let mut fb = Framed::new(right, MessageCodec::default());

        let timeout = Duration::from_secs(5);
        let (ra, rb) = tokio::join!(
            hs_a.negotiate(&ctx_a, &mut fa, timeout),
            hs_b.negotiate(&ctx_b, &mut fb, timeout)
        );
        assert_eq!(ra.unwrap().0, "node-b");
        assert_eq!(rb.unwrap().0, "node-a");
    }

    #[tokio::test]
    async fn test_negotiate_refuses_foreign_domain() {
        let (left, right) = tokio::io::duplex(4096);
        let ctx_a = NetworkContext::new("node-a", "lab").unwrap();
        let ctx_b = NetworkContext::new("node-b", "prod").unwrap();
        let hs_a = Handshake::new("lab", Arc::new(SameDomainPolicy));
        let hs_b = Handshake::new("prod", Arc::new(SameDomainPolicy));
        let mut fa = Framed::new(left, MessageCodec::default());
        let mut fb = Framed::new(right, MessageCodec::default());

        let timeout = Duration::from_secs(5);
        let (ra, rb) = tokio::join!(
            hs_a.negotiate(&ctx_a, &mut fa, timeout),
            hs_b.negotiate(&ctx_b, &mut fb, timeout)
        );
        assert!(matches!(ra, Err(NetworkError::NegotiationRejected { .. })));
        assert!(matches!(rb, Err(NetworkError::NegotiationRejected { .. })));
    }
}
