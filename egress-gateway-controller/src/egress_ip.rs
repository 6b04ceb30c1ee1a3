use std::net::IpAddr;

use crate::error::ResolutionError;
use crate::snapshot::GatewayNode;

/// How a gateway picks its egress address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressIpSource {
    /// Must already be bound to an interface of the gateway node
    Address(IpAddr),
    /// First IPv4 and first IPv6 address of the interface
    Interface(String),
    /// First IPv4 and first IPv6 address of the default-route interface
    DefaultRoute,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EgressAddresses {
    pub v4: Option<IpAddr>,
    pub v6: Option<IpAddr>,
}

impl EgressAddresses {
    fn from_addresses(addresses: &[IpAddr]) -> Self {
        Self {
            v4: addresses.iter().find(|ip| ip.is_ipv4()).copied(),
            v6: addresses.iter().find(|ip| ip.is_ipv6()).copied(),
        }
    }

    /// Egress address for traffic sourced from `source`.
    pub fn for_family(&self, source: &IpAddr) -> Option<IpAddr> {
        match source {
            IpAddr::V4(_) => self.v4,
            IpAddr::V6(_) => self.v6,
        }
    }

    fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

pub fn resolve_egress_ip(
    node: &GatewayNode,
    source: &EgressIpSource,
) -> Result<EgressAddresses, ResolutionError> {
    let unavailable = |reason: String| ResolutionError::NoEgressIPAvailable {
        node: node.name.clone(),
        reason,
    };

    let interface = match source {
        EgressIpSource::Address(ip) => {
            if !node.interfaces.values().flatten().any(|bound| bound == ip) {
                return Err(unavailable(format!("{ip} is not bound to any interface")));
            }
            return Ok(EgressAddresses::from_addresses(std::slice::from_ref(ip)));
        }
        EgressIpSource::Interface(interface) => interface,
        EgressIpSource::DefaultRoute => node
            .default_route_interface
            .as_ref()
            .ok_or_else(|| unavailable("default route interface is unknown".into()))?,
    };

    let addresses = node
        .interfaces
        .get(interface)
        .ok_or_else(|| unavailable(format!("interface {interface} not found")))?;
    let resolved = EgressAddresses::from_addresses(addresses);
    if resolved.is_empty() {
        return Err(unavailable(format!("interface {interface} has no address")));
    }
    Ok(resolved)
}
