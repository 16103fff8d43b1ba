// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! NAT port mapping
//!
//! The gateway protocol sits behind [`PortMapper`], implemented for UPnP
//! IGD gateways by [`UpnpPortMapper`]. [`NatTraversal`] picks which local
//! listener to expose and makes sure one mapping exists for it.

use crate::constants::{NAT_MAPPING_DESCRIPTION, NAT_SEARCH_TIMEOUT};
use crate::error::{NetworkError, Result};
use crate::interfaces::InterfaceProvider;
use async_trait::async_trait;
use igd_next::aio::tokio::{search_gateway, Tokio};
use igd_next::aio::Gateway;
use igd_next::{PortMappingEntry, PortMappingProtocol, SearchOptions};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Upper bound on gateway mapping entries inspected per lookup
const MAX_MAPPING_ENTRIES: u32 = 256;

/// A port mapping held by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal: SocketAddr,
    pub enabled: bool,
}

/// Gateway able to map external ports to local endpoints
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Public address of the gateway
    async fn external_address(&self) -> Result<IpAddr>;

    /// Existing mapping pointing at `internal`
    async fn find_mapping(&self, internal: SocketAddr) -> Result<Option<PortMapping>>;

    /// Re-enable a disabled mapping
    async fn enable_mapping(&self, mapping: &PortMapping) -> Result<()>;

    /// Create a mapping
    async fn add_mapping(
        &self,
        internal: SocketAddr,
        external_port: u16,
        description: &str,
    ) -> Result<PortMapping>;
}

/// Port mapper talking UPnP IGD to the gateway of the local network
///
/// The gateway is searched on first use and kept afterwards.
pub struct UpnpPortMapper {
    search_timeout: Duration,
    gateway: OnceCell<Gateway<Tokio>>,
}

impl Default for UpnpPortMapper {
    fn default() -> Self {
        Self::new(NAT_SEARCH_TIMEOUT)
    }
}

impl UpnpPortMapper {
    pub fn new(search_timeout: Duration) -> Self {
        Self {
            search_timeout,
            gateway: OnceCell::new(),
        }
    }

    async fn gateway(&self) -> Result<&Gateway<Tokio>> {
        self.gateway
            .get_or_try_init(|| async {
                let options = SearchOptions {
                    timeout: Some(self.search_timeout),
                    ..Default::default()
                };
                let gateway = search_gateway(options)
                    .await
                    .map_err(|e| NetworkError::NatError(format!("gateway search failed: {}", e)))?;
                tracing::info!("UPnP gateway found");
                Ok(gateway)
            })
            .await
    }
}

/// Mapping described by a gateway entry, if it forwards TCP to `internal`
fn mapping_from_entry(entry: &PortMappingEntry, internal: SocketAddr) -> Option<PortMapping> {
    if !matches!(entry.protocol, PortMappingProtocol::TCP)
        || entry.internal_port != internal.port()
    {
        return None;
    }
    let client: IpAddr = entry.internal_client.parse().ok()?;
    (client == internal.ip()).then_some(PortMapping {
        external_port: entry.external_port,
        internal,
        enabled: entry.enabled,
    })
}

#[async_trait]
impl PortMapper for UpnpPortMapper {
    async fn external_address(&self) -> Result<IpAddr> {
        self.gateway()
            .await?
            .get_external_ip()
            .await
            .map_err(|e| NetworkError::NatError(format!("external address: {}", e)))
    }

    async fn find_mapping(&self, internal: SocketAddr) -> Result<Option<PortMapping>> {
        let gateway = self.gateway().await?;
        for index in 0..MAX_MAPPING_ENTRIES {
            match gateway.get_generic_port_mapping_entry(index).await {
                Ok(entry) => {
                    if let Some(mapping) = mapping_from_entry(&entry, internal) {
                        return Ok(Some(mapping));
                    }
                }
                // gateways answer past the last entry with an error
                Err(e) => {
                    tracing::trace!("Gateway mapping list ended at {}: {}", index, e);
                    break;
                }
            }
        }
        Ok(None)
    }

    async fn enable_mapping(&self, mapping: &PortMapping) -> Result<()> {
        // adding over an existing mapping switches it back on
        self.add_mapping(mapping.internal, mapping.external_port, NAT_MAPPING_DESCRIPTION)
            .await
            .map(|_| ())
    }

    async fn add_mapping(
        &self,
        internal: SocketAddr,
        external_port: u16,
        description: &str,
    ) -> Result<PortMapping> {
        self.gateway()
            .await?
            .add_port(PortMappingProtocol::TCP, external_port, internal, 0, description)
            .await
            .map_err(|e| {
                NetworkError::NatError(format!(
                    "mapping {} -> {} refused: {}",
                    external_port, internal, e
                ))
            })?;
        Ok(PortMapping {
            external_port,
            internal,
            enabled: true,
        })
    }
}

/// Selects a listener and maps it on the gateway
pub struct NatTraversal {
    mapper: Arc<dyn PortMapper>,
    interfaces: Arc<dyn InterfaceProvider>,
}

impl NatTraversal {
    pub fn new(mapper: Arc<dyn PortMapper>, interfaces: Arc<dyn InterfaceProvider>) -> Self {
        Self { mapper, interfaces }
    }

    /// Listener facing the gateway
    ///
    /// With a probe endpoint, the listener bound to the address the OS
    /// routes the probe through; otherwise the listener on the only
    /// non-loopback address, if there is exactly one.
    pub fn select_listener(
        &self,
        listeners: &[SocketAddr],
        probe: Option<SocketAddr>,
    ) -> Option<SocketAddr> {
        if let Some(local) = probe.and_then(|target| self.interfaces.probe(target)) {
            if let Some(listener) = listeners.iter().find(|l| l.ip() == local) {
                return Some(*listener);
            }
            tracing::debug!("No listener on probed address {}", local);
        }

        let candidates: Vec<&SocketAddr> = listeners
            .iter()
            .filter(|l| !l.ip().is_loopback() && !l.ip().is_unspecified())
            .collect();
        let addresses: HashSet<IpAddr> = candidates.iter().map(|l| l.ip()).collect();
        if addresses.len() == 1 {
            candidates.first().map(|l| **l)
        } else {
            None
        }
    }

    /// Make sure a mapping exists for one listener; returns the external
    /// endpoint, or `None` when no listener qualifies
    pub async fn map(
        &self,
        listeners: &[SocketAddr],
        probe: Option<SocketAddr>,
    ) -> Result<Option<SocketAddr>> {
        let Some(internal) = self.select_listener(listeners, probe) else {
            tracing::info!("No listener unambiguously faces the NAT gateway");
            return Ok(None);
        };

        let external_ip = self.mapper.external_address().await?;
        let mapping = match self.mapper.find_mapping(internal).await? {
            Some(existing) => {
                if !existing.enabled {
                    self.mapper.enable_mapping(&existing).await?;
                    tracing::info!(
                        "Re-enabled NAT mapping {} -> {}",
                        existing.external_port,
                        internal
                    );
                } else {
                    tracing::info!(
                        "Reusing NAT mapping {} -> {}",
                        existing.external_port,
                        internal
                    );
                }
                existing
            }
            None => {
                let created = self
                    .mapper
                    .add_mapping(internal, internal.port(), NAT_MAPPING_DESCRIPTION)
                    .await?;
                tracing::info!("Created NAT mapping {} -> {}", created.external_port, internal);
                created
            }
        };

        Ok(Some(SocketAddr::new(external_ip, mapping.external_port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::tests::StaticInterfaces;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeGateway {
        mappings: Mutex<Vec<PortMapping>>,
        added: Mutex<usize>,
        enabled: Mutex<usize>,
    }

    #[async_trait]
    impl PortMapper for FakeGateway {
        async fn external_address(&self) -> Result<IpAddr> {
            Ok("203.0.113.1".parse().unwrap())
        }

        async fn find_mapping(&self, internal: SocketAddr) -> Result<Option<PortMapping>> {
            Ok(self
                .mappings
                .lock()
                .iter()
                .find(|m| m.internal == internal)
                .copied())
        }

        async fn enable_mapping(&self, mapping: &PortMapping) -> Result<()> {
            *self.enabled.lock() += 1;
            for m in self.mappings.lock().iter_mut() {
                if m.internal == mapping.internal {
                    m.enabled = true;
                }
            }
            Ok(())
        }

        async fn add_mapping(
            &self,
            internal: SocketAddr,
            external_port: u16,
            _description: &str,
        ) -> Result<PortMapping> {
            *self.added.lock() += 1;
            let mapping = PortMapping {
                external_port,
                internal,
                enabled: true,
            };
            self.mappings.lock().push(mapping);
            Ok(mapping)
        }
    }

    fn traversal(gateway: Arc<FakeGateway>, probe_result: Option<IpAddr>) -> NatTraversal {
        NatTraversal::new(
            gateway,
            Arc::new(StaticInterfaces {
                addresses: vec![],
                probe_result,
            }),
        )
    }

    #[tokio::test]
    async fn test_new_mapping_created_once() {
        let gateway = Arc::new(FakeGateway::default());
        let nat = traversal(gateway.clone(), None);
        let listeners: Vec<SocketAddr> =
            vec!["127.0.0.1:5000".parse().unwrap(), "10.0.0.5:5000".parse().unwrap()];

        let external = nat.map(&listeners, None).await.unwrap();
        assert_eq!(external, Some("203.0.113.1:5000".parse().unwrap()));
        nat.map(&listeners, None).await.unwrap();
        assert_eq!(*gateway.added.lock(), 1);
    }

    #[tokio::test]
    async fn test_disabled_mapping_is_reenabled_not_duplicated() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.mappings.lock().push(PortMapping {
            external_port: 40000,
            internal: "10.0.0.5:5000".parse().unwrap(),
            enabled: false,
        });
        let nat = traversal(gateway.clone(), None);

        let external = nat
            .map(&["10.0.0.5:5000".parse().unwrap()], None)
            .await
            .unwrap();
        assert_eq!(external, Some("203.0.113.1:40000".parse().unwrap()));
        assert_eq!(*gateway.added.lock(), 0);
        assert_eq!(*gateway.enabled.lock(), 1);
    }

    fn gateway_entry(protocol: PortMappingProtocol, client: &str, port: u16) -> PortMappingEntry {
        PortMappingEntry {
            remote_host: String::new(),
            external_port: 40000,
            protocol,
            internal_port: port,
            internal_client: client.to_string(),
            enabled: false,
            port_mapping_description: NAT_MAPPING_DESCRIPTION.to_string(),
            lease_duration: 0,
        }
    }

    #[test]
    fn test_gateway_entry_matches_tcp_listener_only() {
        let internal: SocketAddr = "10.0.0.5:5000".parse().unwrap();

        let entry = gateway_entry(PortMappingProtocol::TCP, "10.0.0.5", 5000);
        assert_eq!(
            mapping_from_entry(&entry, internal),
            Some(PortMapping {
                external_port: 40000,
                internal,
                enabled: false,
            })
        );
        for other in [
            gateway_entry(PortMappingProtocol::UDP, "10.0.0.5", 5000),
            gateway_entry(PortMappingProtocol::TCP, "10.0.0.6", 5000),
            gateway_entry(PortMappingProtocol::TCP, "10.0.0.5", 5001),
        ] {
            assert!(mapping_from_entry(&other, internal).is_none());
        }
    }

    #[test]
    fn test_ambiguous_listeners_need_probe() {
        let listeners: Vec<SocketAddr> =
            vec!["10.0.0.5:5000".parse().unwrap(), "192.168.1.5:5000".parse().unwrap()];

        let nat = traversal(Arc::new(FakeGateway::default()), None);
        assert_eq!(nat.select_listener(&listeners, None), None);

        let nat = traversal(
            Arc::new(FakeGateway::default()),
            Some("192.168.1.5".parse().unwrap()),
        );
        assert_eq!(
            nat.select_listener(&listeners, Some("192.168.1.1:1900".parse().unwrap())),
            Some("192.168.1.5:5000".parse().unwrap())
        );
    }
}
