// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network transport layer

use crate::config::SocketOptions;
use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Byte stream a connection can run over
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Result of a successful connect
pub struct Connected {
    pub stream: Box<dyn LinkStream>,
    pub remote_addr: SocketAddr,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Opens outbound streams
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `endpoint`, bounded by `timeout`
    async fn connect(&self, endpoint: SocketAddr, timeout: Duration) -> Result<Connected>;
}

/// TCP-based transport implementation
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    options: SocketOptions,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: SocketAddr, timeout: Duration) -> Result<Connected> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| NetworkError::TimeoutError(format!("Connection to {} timed out", endpoint)))?
            .map_err(|e| NetworkError::ConnectionError(format!("Failed to connect to {}: {}", endpoint, e)))?;

        apply_socket_options(&stream, &self.options)?;

        Ok(Connected {
            stream: Box::new(stream),
            remote_addr: endpoint,
        })
    }
}

/// Apply buffer sizes and no-delay to a connected stream
pub fn apply_socket_options(stream: &TcpStream, options: &SocketOptions) -> Result<()> {
    stream.set_nodelay(options.no_delay)?;
    let socket = SockRef::from(stream);
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(())
}

/// Bind a TCP listener with address reuse; IPv6 listeners are v6-only
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| NetworkError::TransportError(format!("Failed to bind {}: {}", addr, e)))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_transport_connects_to_listener() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::new(SocketOptions::default());
        let (connected, accepted) = tokio::join!(
            transport.connect(addr, Duration::from_secs(5)),
            listener.accept()
        );
        let connected = connected.unwrap();
        let (stream, _) = accepted.unwrap();
        assert_eq!(connected.remote_addr, addr);
        assert!(apply_socket_options(&stream, &SocketOptions::default()).is_ok());
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_refused_connect_is_transient() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::default();
        let err = transport
            .connect(addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
