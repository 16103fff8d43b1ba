// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual sockets
//!
//! Ordered byte channels between two peers, multiplexed over the session
//! layer. A socket is opened by a request to a listening port on the remote
//! peer and identified on each end by a local socket id. Data frames carry
//! a per-socket order number so relayed frames arriving out of order are
//! handed to the reader in sequence.

use crate::constants::{EPHEMERAL_PORT_START, UNASSIGNED_SOCKET};
use crate::error::{NetworkError, Result};
use crate::protocols::{
    Message, MessageBody, PeerId, Priority, SocketAddressing, SocketRawData, TransportMode,
};
use crate::session::{MessageTask, SessionManager};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type SocketRegistry = Arc<DashMap<i64, mpsc::UnboundedSender<SocketEvent>>>;

#[derive(Debug)]
enum SocketEvent {
    Data(u64, Bytes),
    Closed,
}

/// Opens, accepts and feeds virtual sockets
pub struct VirtualSocketManager {
    sessions: Arc<SessionManager>,
    next_socket: AtomicI64,
    next_port: AtomicU16,
    listeners: DashMap<u16, mpsc::Sender<VirtualSocket>>,
    accept_backlog: usize,
    sockets: SocketRegistry,
    pending_opens: DashMap<i64, oneshot::Sender<SocketAddressing>>,
}

impl VirtualSocketManager {
    /// `accept_backlog` bounds the sockets queued on each listener
    pub fn new(sessions: Arc<SessionManager>, accept_backlog: usize) -> Self {
        Self {
            sessions,
            next_socket: AtomicI64::new(1),
            next_port: AtomicU16::new(EPHEMERAL_PORT_START),
            listeners: DashMap::new(),
            accept_backlog: accept_backlog.max(1),
            sockets: Arc::new(DashMap::new()),
            pending_opens: DashMap::new(),
        }
    }

    /// Consume socket traffic handed up by the session layer
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Message>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = incoming.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message);
        }

        // wake readers blocked on sockets that will never see more data
        for entry in self.sockets.iter() {
            let _ = entry.value().send(SocketEvent::Closed);
        }
        tracing::debug!("Virtual socket dispatcher stopped");
    }

    /// Number of open sockets
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    fn handle(&self, message: Message) {
        let sender = message.sender_id;
        match message.body {
            MessageBody::SocketOpenRequest(request) => self.accept_request(&sender, request),
            MessageBody::SocketOpenResponse(response) => {
                match self.pending_opens.remove(&response.target_socket) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!(
                        "Open response from {} for unknown socket {}",
                        sender,
                        response.target_socket
                    ),
                }
            }
            MessageBody::SocketRawData(raw) => {
                let delivered = self
                    .sockets
                    .get(&raw.socket.target_socket)
                    .map(|socket| socket.send(SocketEvent::Data(raw.packet_order, raw.data)).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    tracing::trace!("Data from {} for closed socket {}", sender, raw.socket.target_socket);
                }
            }
            MessageBody::SocketClose(close) => {
                if let Some((_, socket)) = self.sockets.remove(&close.target_socket) {
                    let _ = socket.send(SocketEvent::Closed);
                }
            }
            other => tracing::debug!("Ignoring {:?} from {} in socket dispatcher", other.code(), sender),
        }
    }

    fn accept_request(&self, peer: &str, request: SocketAddressing) {
        let listener = self
            .listeners
            .get(&request.target_port)
            .map(|entry| entry.value().clone());

        let accepted = listener.and_then(|listener| {
            let id = self.allocate_socket();
            let local = SocketAddressing {
                sender_socket: id,
                ..request.reversed()
            };
            let socket = self.register(peer, local);
            match listener.try_send(socket) {
                Ok(()) => Some(local),
                Err(e) => {
                    tracing::warn!("Listener on port {} cannot take socket: {}", request.target_port, e);
                    let mut rejected = e.into_inner();
                    rejected.closed = true;
                    self.sockets.remove(&id);
                    None
                }
            }
        });

        let response = match accepted {
            Some(local) => {
                tracing::debug!(
                    "Accepted socket {} from {} on port {}",
                    local.sender_socket,
                    peer,
                    local.sender_port
                );
                local
            }
            None => {
                tracing::debug!("Refused socket from {} to port {}", peer, request.target_port);
                SocketAddressing {
                    sender_socket: UNASSIGNED_SOCKET,
                    ..request.reversed()
                }
            }
        };

        if let Err(e) = self.send(peer, MessageBody::SocketOpenResponse(response)) {
            tracing::debug!("Open response to {} not sent: {}", peer, e);
        }
    }

    /// Accept sockets opened towards `port`
    pub fn listen(&self, port: u16) -> Result<VirtualListener> {
        if port == 0 {
            return Err(NetworkError::InvalidPort(port));
        }
        match self.listeners.entry(port) {
            Entry::Occupied(_) => Err(NetworkError::ConfigError(format!(
                "virtual port {} already in use",
                port
            ))),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(self.accept_backlog);
                vacant.insert(tx);
                Ok(VirtualListener { port, incoming: rx })
            }
        }
    }

    /// Stop accepting on `port`
    pub fn unlisten(&self, port: u16) {
        self.listeners.remove(&port);
    }

    /// Open a socket to `port` on `peer`
    pub async fn connect(&self, peer: &str, port: u16, timeout: Duration) -> Result<VirtualSocket> {
        if port == 0 {
            return Err(NetworkError::InvalidPort(port));
        }
        if peer.is_empty() {
            return Err(NetworkError::MissingId("target id"));
        }

        let id = self.allocate_socket();
        let local_port = self.allocate_port();
        let (done, response) = oneshot::channel();
        self.pending_opens.insert(id, done);
        // registered before the request so early data is buffered
        let request = SocketAddressing::new(id, UNASSIGNED_SOCKET, local_port, port);
        let mut socket = self.register(peer, request);

        if let Err(e) = self.send(peer, MessageBody::SocketOpenRequest(request)) {
            self.pending_opens.remove(&id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, response).await;
        self.pending_opens.remove(&id);
        match outcome {
            Ok(Ok(answer)) if answer.sender_socket == UNASSIGNED_SOCKET => Err(NetworkError::ConnectionError(
                format!("virtual socket to {}:{} refused", peer, port),
            )),
            Ok(Ok(answer)) => {
                socket.addressing.target_socket = answer.sender_socket;
                tracing::debug!("Socket {} connected to {}:{}", id, peer, port);
                Ok(socket)
            }
            Ok(Err(_)) => Err(NetworkError::Shutdown),
            Err(_) => Err(NetworkError::TimeoutError(format!(
                "virtual socket to {}:{} not answered",
                peer, port
            ))),
        }
    }

    fn register(&self, peer: &str, addressing: SocketAddressing) -> VirtualSocket {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(addressing.sender_socket, tx);
        VirtualSocket {
            peer: peer.to_string(),
            addressing,
            sessions: self.sessions.clone(),
            registry: self.sockets.clone(),
            events: rx,
            next_order: AtomicU64::new(0),
            expected: 0,
            reorder: BTreeMap::new(),
            closed: false,
        }
    }

    fn allocate_socket(&self) -> i64 {
        self.next_socket.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port == u16::MAX {
            self.next_port.store(EPHEMERAL_PORT_START, Ordering::Relaxed);
        }
        port.max(EPHEMERAL_PORT_START)
    }

    fn send(&self, peer: &str, body: MessageBody) -> Result<MessageTask> {
        let message = self.sessions.context().routed(
            peer,
            Priority::High,
            TransportMode::ReliableOrdered,
            body,
        )?;
        self.sessions.send(message)
    }
}

/// Sockets opened towards one local port
#[derive(Debug)]
pub struct VirtualListener {
    port: u16,
    incoming: mpsc::Receiver<VirtualSocket>,
}

impl VirtualListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next accepted socket; `None` once the listener is closed
    pub async fn accept(&mut self) -> Option<VirtualSocket> {
        self.incoming.recv().await
    }
}

/// One end of a virtual socket
pub struct VirtualSocket {
    peer: PeerId,
    addressing: SocketAddressing,
    sessions: Arc<SessionManager>,
    registry: SocketRegistry,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    next_order: AtomicU64,
    expected: u64,
    reorder: BTreeMap<u64, Bytes>,
    closed: bool,
}

impl VirtualSocket {
    /// Remote peer
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Ids and ports as seen from this end
    pub fn addressing(&self) -> SocketAddressing {
        self.addressing
    }

    pub fn local_port(&self) -> u16 {
        self.addressing.sender_port
    }

    pub fn remote_port(&self) -> u16 {
        self.addressing.target_port
    }

    /// Queue `data` for the remote end; the task completes on acknowledgement
    pub fn send(&self, data: Bytes) -> Result<MessageTask> {
        if self.closed {
            return Err(NetworkError::NotConnected(self.peer.clone()));
        }
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let raw = SocketRawData::new(self.addressing, order, data);
        let message = self.sessions.context().routed(
            self.peer.as_str(),
            Priority::Normal,
            TransportMode::ReliableOrdered,
            MessageBody::SocketRawData(raw),
        )?;
        self.sessions.send(message)
    }

    /// Next payload in send order; `None` once the socket is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            if let Some(data) = self.reorder.remove(&self.expected) {
                self.expected += 1;
                return Some(data);
            }
            if self.closed {
                return None;
            }
            match self.events.recv().await {
                Some(SocketEvent::Data(order, data)) => {
                    if order >= self.expected {
                        self.reorder.insert(order, data);
                    }
                }
                Some(SocketEvent::Closed) | None => self.closed = true,
            }
        }
    }

    /// Close both ends
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.registry.remove(&self.addressing.sender_socket);
        if self.addressing.target_socket == UNASSIGNED_SOCKET {
            return Ok(());
        }
        let message = self.sessions.context().routed(
            self.peer.as_str(),
            Priority::Normal,
            TransportMode::ReliableOrdered,
            MessageBody::SocketClose(self.addressing),
        )?;
        self.sessions.send(message).map(|_| ())
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!("Close of socket {} not sent: {}", self.addressing.sender_socket, e);
        }
    }
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("peer", &self.peer)
            .field("addressing", &self.addressing)
            .field("closed", &self.closed)
            .finish()
    }
}
