//! Abstraction over rtnetlink link/address/route operations.
//!
//! [`RealNetlinkOps`] wraps an `rtnetlink::Handle`; tests use the stateful
//! mock in the `mocks` module.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

use std::net::Ipv4Addr;

use super::Error;

pub const DEFAULT_ROUTE_PRIORITY: u32 = 1337;

/// Policy route: `ip route add <destination> via <gateway>` scoped to a
/// preferred source address.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteVia {
    pub destination: Ipv4Network,
    pub source: Option<Ipv4Addr>,
    pub gateway: Ipv4Addr,
    pub priority: u32,
}

impl RouteVia {
    pub fn new(destination: Ipv4Network, source: Option<Ipv4Addr>, gateway: Ipv4Addr) -> Self {
        RouteVia {
            destination,
            source,
            gateway,
            priority: DEFAULT_ROUTE_PRIORITY,
        }
    }
}

/// Kernel link/address/route surface used by the controller.
#[async_trait]
pub trait NetlinkOps: Send + Sync {
    /// Create a bridge device, assign `ip/prefix` and set it up.
    /// Fails with [`Error::DeviceExists`] if a device with that name is
    /// already present.
    async fn create_bridge(&self, name: &str, ip: Ipv4Addr, prefix: u8) -> Result<u32, Error>;
    /// Best-effort removal; a missing device is not an error so this is
    /// safe to call during rollback.
    async fn delete_bridge(&self, name: &str) -> Result<(), Error>;
    /// Make `port_index` a port of `bridge_index`.
    async fn attach_bridge(&self, bridge_index: u32, port_index: u32) -> Result<(), Error>;
    async fn set_interface_addr(&self, if_index: u32, ip: Ipv4Addr, prefix: u8) -> Result<(), Error>;
    async fn add_route_via(&self, route: &RouteVia) -> Result<(), Error>;
    async fn link_index(&self, name: &str) -> Result<Option<u32>, Error>;
    /// IPv4 addresses currently assigned to the interface.
    async fn link_addr_v4(&self, if_index: u32) -> Result<Vec<Ipv4Addr>, Error>;
    /// Egress interface index the kernel would use to reach `probe`:
    /// longest-prefix match over the IPv4 unicast routes, lowest metric
    /// breaking ties.
    async fn route_get(&self, probe: Ipv4Addr) -> Result<Option<u32>, Error>;
}

#[cfg(target_os = "linux")]
pub use real::RealNetlinkOps;

#[cfg(target_os = "linux")]
mod real {
    use futures::TryStreamExt;
    use rtnetlink::packet_route::address::AddressAttribute;
    use rtnetlink::packet_route::link::LinkAttribute;
    use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteType};
    use rtnetlink::{LinkBridge, LinkUnspec, RouteMessageBuilder};

    use std::net::IpAddr;

    use super::*;

    /// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
    #[derive(Clone)]
    pub struct RealNetlinkOps {
        handle: rtnetlink::Handle,
    }

    impl RealNetlinkOps {
        pub fn new(handle: rtnetlink::Handle) -> Self {
            Self { handle }
        }

        async fn links(&self) -> Result<Vec<(u32, String)>, Error> {
            let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;
            Ok(links
                .iter()
                .filter_map(|link| {
                    let name = link.attributes.iter().find_map(|a| match a {
                        LinkAttribute::IfName(n) => Some(n.clone()),
                        _ => None,
                    })?;
                    Some((link.header.index, name))
                })
                .collect())
        }
    }

    #[async_trait]
    impl NetlinkOps for RealNetlinkOps {
        async fn create_bridge(&self, name: &str, ip: Ipv4Addr, prefix: u8) -> Result<u32, Error> {
            if self.link_index(name).await?.is_some() {
                return Err(Error::DeviceExists);
            }

            self.handle.link().add(LinkBridge::new(name).build()).execute().await?;
            let index = self
                .link_index(name)
                .await?
                .ok_or_else(|| Error::NoSuchLink(name.to_string()))?;
            self.handle.address().add(index, IpAddr::V4(ip), prefix).execute().await?;
            self.handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await?;
            Ok(index)
        }

        async fn delete_bridge(&self, name: &str) -> Result<(), Error> {
            match self.link_index(name).await? {
                Some(index) => Ok(self.handle.link().del(index).execute().await?),
                None => Ok(()),
            }
        }

        async fn attach_bridge(&self, bridge_index: u32, port_index: u32) -> Result<(), Error> {
            self.handle
                .link()
                .set(LinkUnspec::new_with_index(port_index).controller(bridge_index).build())
                .execute()
                .await?;
            Ok(())
        }

        async fn set_interface_addr(&self, if_index: u32, ip: Ipv4Addr, prefix: u8) -> Result<(), Error> {
            self.handle
                .address()
                .add(if_index, IpAddr::V4(ip), prefix)
                .execute()
                .await?;
            Ok(())
        }

        async fn add_route_via(&self, route: &RouteVia) -> Result<(), Error> {
            let mut msg = RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(route.destination.ip(), route.destination.prefix())
                .gateway(route.gateway)
                .build();
            msg.attributes.push(RouteAttribute::Priority(route.priority));
            if let Some(source) = route.source {
                msg.attributes.push(RouteAttribute::PrefSource(RouteAddress::Inet(source)));
            }
            self.handle.route().add(msg).execute().await?;
            Ok(())
        }

        async fn link_index(&self, name: &str) -> Result<Option<u32>, Error> {
            Ok(self
                .links()
                .await?
                .into_iter()
                .find_map(|(index, n)| (n == name).then_some(index)))
        }

        async fn link_addr_v4(&self, if_index: u32) -> Result<Vec<Ipv4Addr>, Error> {
            let addrs: Vec<_> = self
                .handle
                .address()
                .get()
                .set_link_index_filter(if_index)
                .execute()
                .try_collect()
                .await?;

            Ok(addrs
                .iter()
                .filter_map(|addr| {
                    addr.attributes.iter().find_map(|a| match a {
                        AddressAttribute::Address(IpAddr::V4(ip)) => Some(*ip),
                        _ => None,
                    })
                })
                .collect())
        }

        async fn route_get(&self, probe: Ipv4Addr) -> Result<Option<u32>, Error> {
            let routes: Vec<_> = self
                .handle
                .route()
                .get(RouteMessageBuilder::<Ipv4Addr>::default().build())
                .execute()
                .try_collect()
                .await?;

            let mut best: Option<(u8, u32, u32)> = None; // (prefix_len, metric, oif)
            for msg in &routes {
                if msg.header.kind != RouteType::Unicast {
                    continue;
                }
                let oif = msg.attributes.iter().find_map(|a| match a {
                    RouteAttribute::Oif(idx) => Some(*idx),
                    _ => None,
                });
                let Some(oif) = oif else { continue };
                let destination = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(*ip),
                        _ => None,
                    })
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                let prefix_len = msg.header.destination_prefix_length;
                let covers = match Ipv4Network::new(destination, prefix_len) {
                    Ok(network) => network.contains(probe),
                    Err(_) => false,
                };
                if !covers {
                    continue;
                }
                let metric = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        RouteAttribute::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0);
                let better = match best {
                    None => true,
                    Some((best_len, best_metric, _)) => {
                        prefix_len > best_len || (prefix_len == best_len && metric < best_metric)
                    }
                };
                if better {
                    best = Some((prefix_len, metric, oif));
                }
            }
            Ok(best.map(|(_, _, oif)| oif))
        }
    }
}
