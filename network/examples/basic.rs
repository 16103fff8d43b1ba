// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Example: Basic overlay usage
//!
//! Run one instance with no arguments, then a second one pointing at the
//! first: `basic peer-2 127.0.0.1:5000`.

use std::sync::Arc;
use std::time::Duration;
use terragraf_network::{
    ListenerConfig, NetworkEvent, NetworkInterface, NetworkService, SameDomainPolicy,
    TerraGrafConfig,
};

const ECHO_PORT: u16 = 7;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let local_id = args.next().unwrap_or_else(|| "peer-1".to_string());
    let remote: Option<std::net::SocketAddr> = args.next().map(|addr| addr.parse()).transpose()?;

    // Create network configuration
    let mut config = TerraGrafConfig::for_peer(local_id.clone(), "demo");
    if remote.is_some() {
        config.listeners = ListenerConfig::Automatic { port: 0 };
    }

    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(1000);
    let network = NetworkService::new(config, Arc::new(SameDomainPolicy), event_tx)?;
    network.start().await?;
    println!("{} listening on {:?}", local_id, network.local_endpoints());

    let client = network.client();

    // Echo every virtual socket opened to the echo port
    let mut listener = client.listen_socket(ECHO_PORT).await?;
    tokio::spawn(async move {
        while let Some(mut socket) = listener.accept().await {
            tokio::spawn(async move {
                while let Some(data) = socket.recv().await {
                    if socket.send(data).is_err() {
                        break;
                    }
                }
            });
        }
    });

    if let Some(remote) = remote {
        network.connect(remote)?;
    }

    let events = client.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                NetworkEvent::PeerConnected(peer_id) => {
                    println!("Peer connected: {}", peer_id);
                    match events.open_socket(&peer_id, ECHO_PORT, Duration::from_secs(5)).await {
                        Ok(mut socket) => {
                            let _ = socket.send(bytes::Bytes::from_static(b"hello"));
                            if let Some(reply) = socket.recv().await {
                                println!("Echo from {}: {:?}", peer_id, reply);
                            }
                        }
                        Err(e) => println!("Echo to {} failed: {}", peer_id, e),
                    }
                }
                NetworkEvent::PeerDisconnected(peer_id) => {
                    println!("Peer disconnected: {}", peer_id);
                }
                NetworkEvent::TopologyChanged => {
                    println!("Known peers: {}", events.known_peers().await.len());
                }
            }
        }
    });

    println!("\nOverlay is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    network.shutdown().await;

    Ok(())
}
