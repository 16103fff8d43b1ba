// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Local interface enumeration

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Source of local addresses
pub trait InterfaceProvider: Send + Sync {
    /// Addresses of usable local interfaces, loopback included
    fn local_addresses(&self, ipv4: bool, ipv6: bool) -> Vec<IpAddr>;

    /// Local address the OS would use to reach `target`
    fn probe(&self, target: SocketAddr) -> Option<IpAddr>;
}

/// Interfaces of the running host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceProvider for SystemInterfaces {
    fn local_addresses(&self, ipv4: bool, ipv6: bool) -> Vec<IpAddr> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!("Cannot enumerate local interfaces: {}", e);
                return Vec::new();
            }
        };

        let mut addresses = Vec::new();
        for interface in interfaces {
            let ip = interface.ip();
            let usable = match ip {
                IpAddr::V4(_) => ipv4,
                // link-local addresses need a scope id to bind
                IpAddr::V6(v6) => ipv6 && !is_unicast_link_local(&v6),
            };
            if usable && !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
        addresses
    }

    fn probe(&self, target: SocketAddr) -> Option<IpAddr> {
        let unspecified: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(unspecified).ok()?;
        socket.connect(target).ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Expand configured endpoints into concrete bind addresses
///
/// A wildcard address becomes one endpoint per local interface of its
/// family plus loopback; other addresses are kept as they are.
pub fn expand_endpoints(
    endpoints: &[SocketAddr],
    provider: &dyn InterfaceProvider,
) -> Vec<SocketAddr> {
    let mut expanded = Vec::new();
    for endpoint in endpoints {
        if !endpoint.ip().is_unspecified() {
            push_unique(&mut expanded, *endpoint);
            continue;
        }

        let (v4, loopback) = match endpoint.ip() {
            IpAddr::V4(_) => (true, IpAddr::V4(Ipv4Addr::LOCALHOST)),
            IpAddr::V6(_) => (false, IpAddr::V6(Ipv6Addr::LOCALHOST)),
        };
        for ip in provider.local_addresses(v4, !v4) {
            push_unique(&mut expanded, SocketAddr::new(ip, endpoint.port()));
        }
        push_unique(&mut expanded, SocketAddr::new(loopback, endpoint.port()));
    }
    expanded
}

fn push_unique(list: &mut Vec<SocketAddr>, addr: SocketAddr) {
    if !list.contains(&addr) {
        list.push(addr);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fixed set of interfaces
    pub(crate) struct StaticInterfaces {
        pub addresses: Vec<IpAddr>,
        pub probe_result: Option<IpAddr>,
    }

    impl InterfaceProvider for StaticInterfaces {
        fn local_addresses(&self, ipv4: bool, ipv6: bool) -> Vec<IpAddr> {
            self.addresses
                .iter()
                .copied()
                .filter(|ip| (ip.is_ipv4() && ipv4) || (ip.is_ipv6() && ipv6))
                .collect()
        }

        fn probe(&self, _target: SocketAddr) -> Option<IpAddr> {
            self.probe_result
        }
    }

    #[test]
    fn test_wildcard_expands_to_interfaces_and_loopback() {
        let provider = StaticInterfaces {
            addresses: vec![
                "10.0.0.5".parse().unwrap(),
                "192.168.1.5".parse().unwrap(),
                "fd00::5".parse().unwrap(),
            ],
            probe_result: None,
        };
        let expanded = expand_endpoints(
            &["0.0.0.0:5000".parse().unwrap(), "10.0.0.5:6000".parse().unwrap()],
            &provider,
        );
        let expected: Vec<SocketAddr> = vec![
            "10.0.0.5:5000".parse().unwrap(),
            "192.168.1.5:5000".parse().unwrap(),
            "127.0.0.1:5000".parse().unwrap(),
            "10.0.0.5:6000".parse().unwrap(),
        ];
        assert_eq!(expanded, expected);
    }

    #[test]
    fn test_link_local_detection() {
        assert!(is_unicast_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_unicast_link_local(&"fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_system_probe_of_loopback() {
        let ip = SystemInterfaces.probe("127.0.0.1:9".parse().unwrap());
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
