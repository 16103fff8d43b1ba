// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session layer
//!
//! A [`Session`] is the logical link to one remote peer id. It owns one
//! active forwarding connection, any number of redundant ones, a
//! message-id → received-count map and an aggregate reply time.
//! [`SessionManager`] negotiates fresh streams, attaches them to sessions,
//! relays routed traffic, keeps the peer graph informed and completes
//! waiters of reliable-mode messages when their acknowledgement returns.

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionHandler, ConnectionId, Direction};
use crate::connectivity_manager::TaskId;
use crate::context::NetworkContext;
use crate::counters::NetworkMetrics;
use crate::error::{NetworkError, Result};
use crate::graph::PeerGraph;
use crate::protocols::wire::{Handshake, MessageCodec};
use crate::protocols::{
    Message, MessageBody, MessageId, PeerId, PeerUpdate, Priority, Relation,
    TopologyInformation, TransportMode,
};
use crate::NetworkEvent;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;

/// Outcome of attaching a connection to a session
#[derive(Debug, Default)]
pub struct Attached {
    /// The session had no forwarding path before
    pub was_pathless: bool,
    /// Connections displaced by the concurrent-connections policy
    pub to_close: Vec<Arc<Connection>>,
}

/// Outcome of detaching a closed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The active connection dropped and a redundant one took over
    Promoted(ConnectionId),
    /// The active connection dropped and nothing could replace it
    Pathless,
    /// A redundant connection dropped
    Redundant,
    /// The connection did not belong to this session
    Unknown,
}

/// Message id → received count for one sender
#[derive(Debug, Default)]
pub struct ReceivedCounts {
    counts: Mutex<HashMap<MessageId, u32>>,
}

impl ReceivedCounts {
    /// Count one more receipt of `id`; returns the new count
    pub fn record(&self, id: MessageId) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, id: MessageId) -> u32 {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }

    fn drain(&self) -> Vec<(MessageId, u32)> {
        self.counts.lock().drain().collect()
    }

    fn absorb(&self, drained: Vec<(MessageId, u32)>) {
        let mut counts = self.counts.lock();
        for (id, count) in drained {
            *counts.entry(id).or_insert(0) += count;
        }
    }
}

#[derive(Default)]
struct Links {
    active: Option<Arc<Connection>>,
    redundant: Vec<Arc<Connection>>,
}

/// Logical link to one remote peer
pub struct Session {
    remote_id: PeerId,
    domain: String,
    links: Mutex<Links>,
    received: ReceivedCounts,
    reply_time: Mutex<Option<Duration>>,
}

impl Session {
    pub fn new(remote_id: impl Into<PeerId>, domain: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            domain: domain.into(),
            links: Mutex::new(Links::default()),
            received: ReceivedCounts::default(),
            reply_time: Mutex::new(None),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Isolation domain the remote peer negotiated with
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Attach a freshly negotiated connection
    ///
    /// Without an open active path the connection becomes active.
    /// Otherwise it is kept as a redundant path; when several concurrent
    /// connections are not allowed, older redundant ones are handed back
    /// for closing.
    pub fn attach(&self, connection: Arc<Connection>, allow_multiple: bool) -> Attached {
        let mut links = self.links.lock();
        let was_pathless = links.active.is_none();
        let mut to_close = Vec::new();

        let active_open = links
            .active
            .as_ref()
            .map(|active| active.is_open())
            .unwrap_or(false);

        if active_open {
            if !allow_multiple {
                to_close.append(&mut links.redundant);
            }
            links.redundant.push(connection);
        } else {
            links.active = Some(connection);
        }

        Attached {
            was_pathless,
            to_close,
        }
    }

    /// Remove a closed connection, promoting a redundant one if needed
    pub fn detach(&self, id: ConnectionId) -> Detached {
        let mut links = self.links.lock();

        if links.active.as_ref().map(|c| c.id()) == Some(id) {
            links.active = None;
            links.redundant.retain(|c| c.is_open());
            if links.redundant.is_empty() {
                return Detached::Pathless;
            }
            let next = links.redundant.remove(0);
            let next_id = next.id();
            links.active = Some(next);
            return Detached::Promoted(next_id);
        }

        let before = links.redundant.len();
        links.redundant.retain(|c| c.id() != id);
        if links.redundant.len() != before {
            Detached::Redundant
        } else {
            Detached::Unknown
        }
    }

    /// Current forwarding connection
    pub fn active(&self) -> Option<Arc<Connection>> {
        self.links.lock().active.clone()
    }

    /// Active connection followed by the redundant ones
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let links = self.links.lock();
        links
            .active
            .iter()
            .chain(links.redundant.iter())
            .cloned()
            .collect()
    }

    pub fn is_pathless(&self) -> bool {
        self.links.lock().active.is_none()
    }

    fn take_connections(&self) -> Vec<Arc<Connection>> {
        let mut links = self.links.lock();
        let mut taken: Vec<_> = links.active.take().into_iter().collect();
        taken.append(&mut links.redundant);
        taken
    }

    /// Count one more receipt of `id`; returns the new count
    pub fn record_received(&self, id: MessageId) -> u32 {
        self.received.record(id)
    }

    pub fn received_count(&self, id: MessageId) -> u32 {
        self.received.get(id)
    }

    /// Fold another session's counts into this one and clear them there
    pub fn merge_received_from(&self, other: &Session) {
        // never hold both maps at once
        self.received.absorb(other.received.drain());
    }

    /// Fold a new sample into the aggregate reply time
    pub fn record_reply_time(&self, sample: Duration) {
        let mut reply_time = self.reply_time.lock();
        *reply_time = Some(match *reply_time {
            Some(old) => (old + sample) / 2,
            None => sample,
        });
    }

    pub fn reply_time(&self) -> Option<Duration> {
        *self.reply_time.lock()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_id", &self.remote_id)
            .field("domain", &self.domain)
            .field("connections", &self.connections().len())
            .field("reply_time", &self.reply_time())
            .finish()
    }
}

type PendingAcks = DashMap<MessageId, PendingAck>;

/// An outbound message and its optional completion signal
///
/// Dropping a task that still waits removes its acknowledgement entry.
#[derive(Debug)]
pub struct MessageTask {
    message_id: MessageId,
    completion: Option<oneshot::Receiver<Duration>>,
    pending: Weak<PendingAcks>,
    started: Instant,
    elapsed: Option<Duration>,
    success: bool,
}

impl MessageTask {
    /// Task that needs no acknowledgement
    fn completed(message_id: MessageId) -> Self {
        Self {
            message_id,
            completion: None,
            pending: Weak::new(),
            started: Instant::now(),
            elapsed: None,
            success: true,
        }
    }

    fn awaiting(
        message_id: MessageId,
        completion: oneshot::Receiver<Duration>,
        pending: Weak<PendingAcks>,
    ) -> Self {
        Self {
            message_id,
            completion: Some(completion),
            pending,
            started: Instant::now(),
            elapsed: None,
            success: false,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Time from send to acknowledgement
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Wait for the acknowledgement; `false` once `timeout` expires
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        let Some(completion) = self.completion.take() else {
            return self.success;
        };
        match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(elapsed)) => {
                self.elapsed = Some(elapsed);
                self.success = true;
            }
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(
                    "No acknowledgement for message {} after {:?}",
                    self.message_id,
                    self.started.elapsed()
                );
                self.success = false;
            }
        }
        self.success
    }
}

impl Drop for MessageTask {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            pending.remove(&self.message_id);
        }
    }
}

/// A connection opened by an outbound task went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLost {
    pub task: TaskId,
    pub peer: PeerId,
    /// Closed by policy (duplicate or surplus connection), not by failure
    pub retired: bool,
}

/// Where the session layer reports to
#[derive(Clone)]
pub struct SessionOutputs {
    pub events: mpsc::Sender<NetworkEvent>,
    pub lost: mpsc::UnboundedSender<ConnectionLost>,
    pub sockets: mpsc::UnboundedSender<Message>,
}

/// How a stream reached the session layer
#[derive(Debug, Clone)]
pub struct LinkMeta {
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub origin_task: Option<TaskId>,
    /// Replace an existing session with the same peer
    pub close_duplicate: bool,
    /// When the connect started; seeds the session reply time
    pub started: Instant,
}

impl LinkMeta {
    pub fn inbound(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            direction: Direction::Inbound,
            origin_task: None,
            close_duplicate: false,
            started: Instant::now(),
        }
    }

    pub fn outbound(remote_addr: SocketAddr, origin_task: Option<TaskId>, started: Instant) -> Self {
        Self {
            remote_addr,
            direction: Direction::Outbound,
            origin_task,
            close_duplicate: false,
            started,
        }
    }
}

#[derive(Debug)]
struct PendingAck {
    target: PeerId,
    started: Instant,
    done: oneshot::Sender<Duration>,
}

/// Owns every session of the local peer
pub struct SessionManager {
    ctx: Arc<NetworkContext>,
    graph: Arc<PeerGraph>,
    handshake: Handshake,
    codec: MessageCodec,
    config: SessionConfig,
    sessions: DashMap<PeerId, Arc<Session>>,
    pending: Arc<PendingAcks>,
    /// Receive counts of senders without a session of their own
    relayed_received: DashMap<PeerId, Arc<ReceivedCounts>>,
    next_connection: AtomicU64,
    outputs: SessionOutputs,
    metrics: NetworkMetrics,
}

impl SessionManager {
    pub fn new(
        ctx: Arc<NetworkContext>,
        graph: Arc<PeerGraph>,
        handshake: Handshake,
        codec: MessageCodec,
        config: SessionConfig,
        outputs: SessionOutputs,
        metrics: NetworkMetrics,
    ) -> Self {
        Self {
            ctx,
            graph,
            handshake,
            codec,
            config,
            sessions: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            relayed_received: DashMap::new(),
            next_connection: AtomicU64::new(1),
            outputs,
            metrics,
        }
    }

    pub fn context(&self) -> &Arc<NetworkContext> {
        &self.ctx
    }

    pub fn graph(&self) -> &Arc<PeerGraph> {
        &self.graph
    }

    /// Get a session by remote peer id
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Peers with an active forwarding connection
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_pathless())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Messages still waiting for an acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Negotiate a connected stream and attach it to a session
    ///
    /// On any negotiation failure the stream is dropped and no session is
    /// created or touched.
    pub async fn establish<S>(self: &Arc<Self>, stream: S, meta: LinkMeta) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, self.codec.clone());
        let (remote_id, negotiation) = match self
            .handshake
            .negotiate(&self.ctx, &mut framed, self.config.negotiation_timeout)
            .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                if let NetworkError::NegotiationRejected { .. } = e {
                    self.metrics.inc_rejected_negotiations();
                    tracing::warn!("Negotiation with {} rejected: {}", meta.remote_addr, e);
                } else {
                    tracing::debug!("Negotiation with {} failed: {}", meta.remote_addr, e);
                }
                return Err(e);
            }
        };

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (connection, driver) = Connection::new(
            id,
            remote_id.clone(),
            meta.remote_addr,
            meta.direction,
            meta.origin_task,
            framed,
            self.ctx.clone(),
        );

        let (session, attached, replaced) =
            self.attach(&remote_id, &negotiation.domain, connection.clone(), meta.close_duplicate);
        session.record_reply_time(meta.started.elapsed());

        self.metrics.inc_active_connections();
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        driver.spawn(connection.clone(), handler);

        tracing::info!(
            "Connection {} to {} ({:?}, {}) attached",
            id,
            remote_id,
            meta.direction,
            meta.remote_addr
        );

        for surplus in attached.to_close {
            tracing::debug!("Closing surplus connection {} to {}", surplus.id(), remote_id);
            surplus.retire();
            surplus.close();
        }

        if attached.was_pathless && !replaced {
            self.on_session_connected(&session);
        }

        Ok(remote_id)
    }

    fn attach(
        &self,
        remote_id: &str,
        domain: &str,
        connection: Arc<Connection>,
        close_duplicate: bool,
    ) -> (Arc<Session>, Attached, bool) {
        let mut displaced = Vec::new();
        let session = match self.sessions.entry(remote_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if close_duplicate && !entry.get().is_pathless() {
                    let fresh = Arc::new(Session::new(remote_id, domain));
                    fresh.merge_received_from(entry.get());
                    displaced = entry.get().take_connections();
                    entry.insert(fresh.clone());
                    tracing::info!("Replacing duplicate session with {}", remote_id);
                    fresh
                } else {
                    entry.get().clone()
                }
            }
            Entry::Vacant(entry) => {
                tracing::info!("Session created for {}", remote_id);
                let session = Arc::new(Session::new(remote_id, domain));
                if let Some((_, counts)) = self.relayed_received.remove(remote_id) {
                    session.received.absorb(counts.drain());
                }
                entry.insert(session).value().clone()
            }
        };

        let replaced = !displaced.is_empty();
        let mut attached = session.attach(connection, self.config.allow_multiple_connections);
        attached.to_close.extend(displaced);
        (session, attached, replaced)
    }

    fn on_session_connected(&self, session: &Session) {
        let peer = session.remote_id();
        let change = self.graph.add_direct(peer, session.domain());
        self.emit(NetworkEvent::PeerConnected(peer.to_string()));

        match self.ctx.routed(
            peer,
            Priority::High,
            TransportMode::BestEffort,
            MessageBody::TopologyInformation(self.graph.snapshot()),
        ) {
            Ok(snapshot) => {
                if let Err(e) = self.transmit(snapshot) {
                    tracing::debug!("Cannot send topology snapshot to {}: {}", peer, e);
                }
            }
            Err(e) => tracing::error!("Cannot build topology snapshot: {}", e),
        }

        self.flood(
            MessageBody::TopologyInformation(TopologyInformation::RelationUpdate {
                relation: Relation::new(self.ctx.local_id(), peer),
                connected: true,
            }),
            &[peer],
        );
        if change.changed {
            self.emit(NetworkEvent::TopologyChanged);
        }
    }

    fn on_session_pathless(&self, peer: &str) {
        tracing::info!("Session with {} has no path left", peer);
        let change = self.graph.remove_direct(peer);
        self.emit(NetworkEvent::PeerDisconnected(peer.to_string()));

        self.flood(
            MessageBody::TopologyInformation(TopologyInformation::RelationUpdate {
                relation: Relation::new(self.ctx.local_id(), peer),
                connected: false,
            }),
            &[peer],
        );
        if change.changed {
            self.emit(NetworkEvent::TopologyChanged);
        }
        self.forget_unreachable(&change.unreachable);
    }

    /// Destroy sessions of peers that left the graph and have no path
    ///
    /// Acknowledgements still awaited from those peers are abandoned, which
    /// fails their waiters right away.
    fn forget_unreachable(&self, unreachable: &[PeerId]) {
        if unreachable.is_empty() {
            return;
        }
        for id in unreachable {
            if self
                .sessions
                .remove_if(id, |_, session| session.is_pathless())
                .is_some()
            {
                tracing::info!("Session with {} destroyed, peer unreachable", id);
            }
            self.relayed_received.remove(id);
        }

        let before = self.pending.len();
        self.pending
            .retain(|_, pending| !unreachable.contains(&pending.target));
        let abandoned = before.saturating_sub(self.pending.len());
        if abandoned > 0 {
            tracing::debug!("Abandoned {} acknowledgements from unreachable peers", abandoned);
        }
    }

    /// Count one receipt of `id` from `sender`
    ///
    /// Counts live in the sender's session, or in a table of their own for
    /// senders only heard through relays, so ids of different senders
    /// never meet.
    fn record_received(&self, sender: &str, id: MessageId) -> u32 {
        if let Some(session) = self.session(sender) {
            return session.record_received(id);
        }
        let counts = self
            .relayed_received
            .entry(sender.to_string())
            .or_default()
            .value()
            .clone();
        counts.record(id)
    }

    /// Tell every neighbour about a changed attribute of the local peer
    pub fn publish_local_update(&self, update: PeerUpdate) {
        if update.peer() != self.ctx.local_id() {
            tracing::warn!("Refusing to publish an update about {}", update.peer());
            return;
        }
        self.flood(MessageBody::PeerUpdate(update), &[]);
    }

    /// Raise or clear a reachability block on `peer` and propagate it
    ///
    /// A blocked peer stays reachable itself but is never used as a relay.
    /// Returns whether the local graph changed.
    pub fn set_reachability(&self, peer: &str, blocked: bool) -> bool {
        let info = TopologyInformation::Reachability {
            peer: peer.to_string(),
            blocked,
        };
        let change = self.graph.apply_topology(&info);
        if change.changed {
            tracing::info!(
                "Reachability block on {} {}",
                peer,
                if blocked { "raised" } else { "cleared" }
            );
            self.flood(MessageBody::TopologyInformation(info), &[]);
            self.emit(NetworkEvent::TopologyChanged);
        }
        self.forget_unreachable(&change.unreachable);
        change.changed
    }

    /// Send a routed message
    ///
    /// Locally originated reliable-mode messages get a completion signal
    /// fired by the matching acknowledgement; everything else is complete
    /// on return.
    pub fn send(&self, message: Message) -> Result<MessageTask> {
        let target = message
            .target_id()
            .ok_or(NetworkError::MissingId("target id"))?;
        if target == self.ctx.local_id() {
            return Err(NetworkError::InvalidMessage(
                "message addressed to the local peer".to_string(),
            ));
        }

        let id = message.message_id;
        let tracked = message.is_reliable() && message.sender_id == self.ctx.local_id();
        let task = if tracked {
            let (done, completion) = oneshot::channel();
            self.pending.insert(
                id,
                PendingAck {
                    target: target.to_string(),
                    started: Instant::now(),
                    done,
                },
            );
            MessageTask::awaiting(id, completion, Arc::downgrade(&self.pending))
        } else {
            MessageTask::completed(id)
        };

        if let Err(e) = self.transmit(message) {
            self.pending.remove(&id);
            return Err(e);
        }
        self.metrics.inc_messages_sent();
        Ok(task)
    }

    /// Send and wait for the acknowledgement; `false` on failure or expiry
    pub async fn send_and_wait(&self, message: Message, timeout: Duration) -> bool {
        let id = message.message_id;
        let mut task = match self.send(message) {
            Ok(task) => task,
            Err(e) => {
                tracing::debug!("Send of message {} failed: {}", id, e);
                return false;
            }
        };
        let delivered = task.wait(timeout).await;
        if !delivered {
            self.pending.remove(&id);
            self.metrics.inc_ack_timeouts();
        }
        delivered
    }

    /// Put a message on the active connection towards its target
    fn transmit(&self, message: Message) -> Result<()> {
        let target = message
            .target_id()
            .ok_or(NetworkError::MissingId("target id"))?;
        let hop = self
            .graph
            .next_hop(target)
            .unwrap_or_else(|| target.to_string());
        let session = self
            .session(&hop)
            .ok_or_else(|| NetworkError::PeerNotFound(target.to_string()))?;
        let connection = session
            .active()
            .ok_or_else(|| NetworkError::NotConnected(hop.clone()))?;
        connection.send(message)
    }

    /// Send a copy of `body` to every direct neighbour not in `except`
    fn flood(&self, body: MessageBody, except: &[&str]) {
        for neighbour in self.graph.direct_peers() {
            if except.contains(&neighbour.as_str()) {
                continue;
            }
            let message = match self.ctx.routed(
                neighbour.as_str(),
                Priority::High,
                TransportMode::BestEffort,
                body.clone(),
            ) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("Cannot build topology message: {}", e);
                    return;
                }
            };
            if let Err(e) = self.transmit(message) {
                tracing::debug!("Topology update to {} not sent: {}", neighbour, e);
            }
        }
    }

    fn emit(&self, event: NetworkEvent) {
        if let Err(e) = self.outputs.events.try_send(event) {
            tracing::debug!("Network event dropped: {}", e);
        }
    }

    fn acknowledge(&self, message: &Message) {
        match self.ctx.acknowledge(message.sender_id.as_str(), message.message_id) {
            Ok(ack) => {
                if let Err(e) = self.transmit(ack) {
                    tracing::debug!("Acknowledge to {} not sent: {}", message.sender_id, e);
                }
            }
            Err(e) => tracing::error!("Cannot build acknowledge: {}", e),
        }
    }

    fn complete_ack(&self, from: &str, acknowledged_id: MessageId) {
        let Some((_, pending)) = self.pending.remove(&acknowledged_id) else {
            tracing::trace!("Late or unknown acknowledge {} from {}", acknowledged_id, from);
            return;
        };
        let elapsed = pending.started.elapsed();
        let session = self.session(&pending.target).or_else(|| {
            self.graph
                .next_hop(&pending.target)
                .and_then(|hop| self.session(&hop))
        });
        if let Some(session) = session {
            session.record_reply_time(elapsed);
        }
        let _ = pending.done.send(elapsed);
    }

    fn handle_local(&self, connection: &Arc<Connection>, message: Message) {
        let reliable = message.is_reliable();
        let sender = message.sender_id.clone();

        match message.body {
            MessageBody::Acknowledge { acknowledged_id } => {
                self.complete_ack(&sender, acknowledged_id);
                return;
            }
            MessageBody::TopologyInformation(ref info) => {
                let change = self.graph.apply_topology(info);
                if change.changed {
                    self.flood(message.body.clone(), &[connection.remote_id(), sender.as_str()]);
                    self.emit(NetworkEvent::TopologyChanged);
                }
                self.forget_unreachable(&change.unreachable);
            }
            MessageBody::PeerUpdate(ref update) => {
                if self.graph.apply_peer_update(update) {
                    self.flood(message.body.clone(), &[connection.remote_id(), sender.as_str()]);
                    self.emit(NetworkEvent::TopologyChanged);
                }
            }
            MessageBody::SocketOpenRequest(_)
            | MessageBody::SocketOpenResponse(_)
            | MessageBody::SocketClose(_)
            | MessageBody::SocketRawData(_) => {
                if reliable {
                    self.acknowledge(&message);
                }
                if self.outputs.sockets.send(message).is_err() {
                    tracing::debug!("Socket traffic from {} dropped, no consumer", sender);
                }
                return;
            }
            MessageBody::LowLevelAcknowledge { .. }
            | MessageBody::Negotiation(_)
            | MessageBody::Discovery(_) => {
                tracing::debug!(
                    "Unexpected {:?} from {} on an established connection",
                    message.code(),
                    sender
                );
                return;
            }
        }

        if reliable {
            self.acknowledge(&message);
        }
    }

    /// Close every connection of every session
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for session in sessions {
            for connection in session.connections() {
                connection.close();
            }
        }
    }
}

impl ConnectionHandler for SessionManager {
    fn on_message(&self, connection: &Arc<Connection>, message: Message) {
        self.metrics.inc_messages_received();

        let count = self.record_received(&message.sender_id, message.message_id);

        // link-level kinds carry no target and never travel further
        let local = message
            .target_id()
            .map(|target| target == self.ctx.local_id())
            .unwrap_or(true);
        if count > 1 {
            self.metrics.inc_duplicates_received();
            tracing::trace!(
                "Duplicate message {} from {} (seen {} times)",
                message.message_id,
                message.sender_id,
                count
            );
            if local && message.is_reliable() {
                self.acknowledge(&message);
            }
            return;
        }

        if local {
            self.handle_local(connection, message);
            return;
        }

        let target = message.target_id().unwrap_or_default().to_string();
        match self.transmit(message) {
            Ok(()) => self.metrics.inc_messages_relayed(),
            Err(e) => tracing::debug!("Relay towards {} dropped: {}", target, e),
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        self.metrics.dec_active_connections();
        let peer = connection.remote_id();
        tracing::info!(
            "Connection {} to {} ({}) closed",
            connection.id(),
            peer,
            connection.remote_addr()
        );

        if let Some(session) = self.session(peer) {
            match session.detach(connection.id()) {
                Detached::Pathless => self.on_session_pathless(peer),
                Detached::Promoted(next) => {
                    tracing::info!("Connection {} promoted to active path for {}", next, peer)
                }
                Detached::Redundant | Detached::Unknown => {}
            }
        }

        if let Some(task) = connection.origin_task() {
            let lost = ConnectionLost {
                task,
                peer: peer.to_string(),
                retired: connection.is_retired(),
            };
            if self.outputs.lost.send(lost).is_err() {
                tracing::debug!("Connection loss of task {} not reported", task);
            }
        }
    }
}
