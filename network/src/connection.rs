// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical connection to a remote peer
//!
//! A connection owns one negotiated framed stream. Outbound messages go
//! through three priority queues drained by a writer task (High before
//! Normal before Low, FIFO within one priority). A reader task answers
//! reliable-mode frames with a `LowLevelAcknowledge`, uses the returning
//! acknowledgements to measure the link round-trip time, and hands
//! everything else to a [`ConnectionHandler`].

use crate::connectivity_manager::TaskId;
use crate::context::NetworkContext;
use crate::error::{NetworkError, Result};
use crate::protocols::wire::MessageCodec;
use crate::protocols::{Message, MessageBody, MessageId, PeerId, Priority};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Receives traffic and the close notification of a connection
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A frame other than a link-level acknowledgement arrived
    fn on_message(&self, connection: &Arc<Connection>, message: Message);

    /// The connection is closed; called exactly once
    fn on_closed(&self, connection: &Arc<Connection>);
}

/// One physical stream to a remote peer
pub struct Connection {
    id: ConnectionId,
    remote_id: PeerId,
    remote_addr: SocketAddr,
    direction: Direction,
    origin_task: Option<TaskId>,
    state: Mutex<ConnectionState>,
    rtt: Mutex<Option<Duration>>,
    high_tx: mpsc::UnboundedSender<Message>,
    normal_tx: mpsc::UnboundedSender<Message>,
    low_tx: mpsc::UnboundedSender<Message>,
    unacked: DashMap<MessageId, Instant>,
    cancel: CancellationToken,
    retired: AtomicBool,
    close_reported: AtomicBool,
}

/// Half of a connection not yet running; see [`Connection::new`]
pub struct ConnectionDriver<S> {
    framed: Framed<S, MessageCodec>,
    ctx: Arc<NetworkContext>,
    high_rx: mpsc::UnboundedReceiver<Message>,
    normal_rx: mpsc::UnboundedReceiver<Message>,
    low_rx: mpsc::UnboundedReceiver<Message>,
}

impl Connection {
    /// Wrap a negotiated stream
    ///
    /// The returned driver must be spawned once the connection is attached
    /// to its session, so that no frame is handled before the session
    /// knows about the connection.
    pub fn new<S>(
        id: ConnectionId,
        remote_id: PeerId,
        remote_addr: SocketAddr,
        direction: Direction,
        origin_task: Option<TaskId>,
        framed: Framed<S, MessageCodec>,
        ctx: Arc<NetworkContext>,
    ) -> (Arc<Self>, ConnectionDriver<S>) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            id,
            remote_id,
            remote_addr,
            direction,
            origin_task,
            state: Mutex::new(ConnectionState::Open),
            rtt: Mutex::new(None),
            high_tx,
            normal_tx,
            low_tx,
            unacked: DashMap::new(),
            cancel: CancellationToken::new(),
            retired: AtomicBool::new(false),
            close_reported: AtomicBool::new(false),
        });

        let driver = ConnectionDriver {
            framed,
            ctx,
            high_rx,
            normal_rx,
            low_rx,
        };

        (connection, driver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Outbound task that opened this connection, if any
    pub fn origin_task(&self) -> Option<TaskId> {
        self.origin_task
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Smoothed link round-trip time
    pub fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock()
    }

    /// Queue a message according to its priority
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.is_open() {
            return Err(NetworkError::NotConnected(self.remote_id.clone()));
        }
        let queue = match message.priority() {
            Priority::High => &self.high_tx,
            Priority::Normal => &self.normal_tx,
            Priority::Low => &self.low_tx,
        };
        queue.send(message)?;
        Ok(())
    }

    /// Mark the connection as closed by policy rather than by failure
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Start closing; the reader task reports the close to the handler
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
            }
        }
        self.cancel.cancel();
    }

    fn record_rtt(&self, sample: Duration) {
        let mut rtt = self.rtt.lock();
        *rtt = Some(match *rtt {
            Some(old) => (old * 7 + sample) / 8,
            None => sample,
        });
    }

    fn finish(self: &Arc<Self>, handler: &Arc<dyn ConnectionHandler>) {
        *self.state.lock() = ConnectionState::Closed;
        self.cancel.cancel();
        if !self.close_reported.swap(true, Ordering::AcqRel) {
            handler.on_closed(self);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl<S> ConnectionDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Spawn the writer and reader tasks
    pub fn spawn(
        self,
        connection: Arc<Connection>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> JoinHandle<()> {
        let ConnectionDriver {
            framed,
            ctx,
            mut high_rx,
            mut normal_rx,
            mut low_rx,
        } = self;
        let (mut sink, mut stream) = framed.split();

        let writer_conn = connection.clone();
        let writer = tokio::spawn(async move {
            let cancel = writer_conn.cancel.clone();
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(m) = high_rx.recv() => m,
                    Some(m) = normal_rx.recv() => m,
                    Some(m) = low_rx.recv() => m,
                    else => break,
                };

                if message.is_reliable() {
                    writer_conn.unacked.insert(message.message_id, Instant::now());
                }
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(
                        "Write to {} ({}) failed: {}",
                        writer_conn.remote_id,
                        writer_conn.remote_addr,
                        e
                    );
                    writer_conn.close();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let cancel = connection.cancel.clone();
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = stream.next() => frame,
                };

                match frame {
                    Some(Ok(message)) => Self::dispatch(&connection, &ctx, &handler, message),
                    Some(Err(e)) => {
                        tracing::warn!(
                            "Dropping connection to {} ({}): {}",
                            connection.remote_id,
                            connection.remote_addr,
                            e
                        );
                        break;
                    }
                    None => {
                        tracing::debug!("Connection to {} closed by remote", connection.remote_id);
                        break;
                    }
                }
            }
            connection.finish(&handler);
            let _ = writer.await;
        })
    }

    fn dispatch(
        connection: &Arc<Connection>,
        ctx: &NetworkContext,
        handler: &Arc<dyn ConnectionHandler>,
        message: Message,
    ) {
        if let MessageBody::LowLevelAcknowledge { acknowledged_id } = message.body {
            if let Some((_, sent)) = connection.unacked.remove(&acknowledged_id) {
                connection.record_rtt(sent.elapsed());
            }
            return;
        }

        if message.is_reliable() {
            match ctx.low_level_acknowledge(message.message_id) {
                Ok(ack) => {
                    let _ = connection.send(ack);
                }
                Err(e) => tracing::error!("Cannot build frame acknowledgement: {}", e),
            }
        }

        handler.on_message(connection, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{SocketAddressing, SocketRawData, TransportMode};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct Collect {
        tx: mpsc::UnboundedSender<Message>,
        closed: AtomicUsize,
    }

    impl ConnectionHandler for Collect {
        fn on_message(&self, _connection: &Arc<Connection>, message: Message) {
            let _ = self.tx.send(message);
        }

        fn on_closed(&self, _connection: &Arc<Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collector() -> (Arc<Collect>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Collect {
                tx,
                closed: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    fn pair() -> (
        (Arc<Connection>, ConnectionDriver<tokio::io::DuplexStream>),
        (Arc<Connection>, ConnectionDriver<tokio::io::DuplexStream>),
        Arc<NetworkContext>,
    ) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let a_ctx = Arc::new(NetworkContext::new("a", "lab").unwrap());
        let b_ctx = Arc::new(NetworkContext::new("b", "lab").unwrap());
        let a = Connection::new(
            1,
            "b".into(),
            addr,
            Direction::Outbound,
            None,
            Framed::new(left, MessageCodec::default()),
            a_ctx.clone(),
        );
        let b = Connection::new(
            2,
            "a".into(),
            addr,
            Direction::Inbound,
            None,
            Framed::new(right, MessageCodec::default()),
            b_ctx,
        );
        (a, b, a_ctx)
    }

    fn data(ctx: &NetworkContext, order: u64) -> Message {
        let socket = SocketAddressing::new(1, 2, 50000, 7000);
        ctx.routed(
            "b",
            Priority::Normal,
            TransportMode::ReliableOrdered,
            MessageBody::SocketRawData(SocketRawData::new(socket, order, Bytes::from_static(b"x"))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reliable_messages_keep_send_order() {
        let ((a, a_driver), (b, b_driver), ctx) = pair();
        let (a_handler, _a_rx) = collector();
        let (b_handler, mut b_rx) = collector();
        a_driver.spawn(a.clone(), a_handler);
        b_driver.spawn(b.clone(), b_handler);

        let m1 = data(&ctx, 0);
        let m2 = data(&ctx, 1);
        a.send(m1.clone()).unwrap();
        a.send(m2.clone()).unwrap();

        assert_eq!(b_rx.recv().await.unwrap().message_id, m1.message_id);
        assert_eq!(b_rx.recv().await.unwrap().message_id, m2.message_id);
    }

    #[tokio::test]
    async fn test_frame_acknowledgement_measures_rtt() {
        let ((a, a_driver), (b, b_driver), ctx) = pair();
        let (a_handler, _a_rx) = collector();
        let (b_handler, mut b_rx) = collector();
        a_driver.spawn(a.clone(), a_handler);
        b_driver.spawn(b.clone(), b_handler);

        a.send(data(&ctx, 0)).unwrap();
        b_rx.recv().await.unwrap();

        for _ in 0..100 {
            if a.rtt().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(a.rtt().is_some());
        assert!(a.unacked.is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_reported_once() {
        let ((a, a_driver), (b, b_driver), _ctx) = pair();
        let (a_handler, _a_rx) = collector();
        let (b_handler, _b_rx) = collector();
        let a_task = a_driver.spawn(a.clone(), a_handler.clone());
        b_driver.spawn(b.clone(), b_handler);

        b.close();
        a_task.await.unwrap();

        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(a_handler.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            a.send(data(&NetworkContext::new("a", "lab").unwrap(), 0)),
            Err(NetworkError::NotConnected(_))
        ));
    }
}
