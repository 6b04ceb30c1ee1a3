use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use egress_gateway_common::{
    DEFAULT_ROUTE_INTERFACE_ANNOTATION, INTERFACES_ANNOTATION, NodeInterfaces,
};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

const RTF_UP: u32 = 0x1;

/// Addresses of every non-loopback interface in the order the kernel
/// reports them. IPv6 link-local addresses are skipped.
pub fn discover_interfaces() -> Result<NodeInterfaces> {
    let addrs = getifaddrs()?.filter_map(|ifaddr| {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            return None;
        }
        let address = ifaddr.address?;
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            return None;
        };
        Some((ifaddr.interface_name, ip))
    });
    Ok(collect_interfaces(addrs))
}

fn collect_interfaces(addrs: impl IntoIterator<Item = (String, IpAddr)>) -> NodeInterfaces {
    let mut interfaces = NodeInterfaces::new();
    for (name, ip) in addrs {
        if let IpAddr::V6(v6) = ip
            && v6.is_unicast_link_local()
        {
            continue;
        }
        let ips = interfaces.entry(name).or_default();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    interfaces
}

/// Interface of the lowest-metric IPv4 default route, falling back to IPv6.
pub async fn default_route_interface(proc_net: &Path) -> Result<Option<String>> {
    let v4 = match tokio::fs::read_to_string(proc_net.join("route")).await {
        Ok(table) => parse_ipv4_default(&table),
        Err(e) => {
            debug!(%e, "ipv4 route table unavailable");
            None
        }
    };
    if v4.is_some() {
        return Ok(v4);
    }
    match tokio::fs::read_to_string(proc_net.join("ipv6_route")).await {
        Ok(table) => Ok(parse_ipv6_default(&table)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_ipv4_default(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let metric: u32 = fields[6].parse().ok()?;
            let default = fields[1] == "00000000" && fields[7] == "00000000";
            (default && flags & RTF_UP != 0).then(|| (metric, fields[0]))
        })
        .min()
        .map(|(_, iface)| iface.to_string())
}

fn parse_ipv6_default(table: &str) -> Option<String> {
    table
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let default = fields[0].bytes().all(|b| b == b'0') && fields[1] == "00";
            let flags = u32::from_str_radix(fields[8], 16).ok()?;
            let metric = u32::from_str_radix(fields[5], 16).ok()?;
            let iface = fields[9];
            (default && flags & RTF_UP != 0 && iface != "lo").then(|| (metric, iface))
        })
        .min()
        .map(|(_, iface)| iface.to_string())
}

async fn publish(
    api: &Api<Node>,
    node_name: &str,
    interfaces: &NodeInterfaces,
    default_route: Option<&str>,
) -> Result<()> {
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                INTERFACES_ANNOTATION: serde_json::to_string(interfaces)?,
                DEFAULT_ROUTE_INTERFACE_ANNOTATION: default_route,
            }
        }
    });
    api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Interfaces and default route interface as seen on this node.
type Observed = (NodeInterfaces, Option<String>);

async fn read_node_interfaces(proc_net: &Path) -> Result<Observed> {
    Ok((discover_interfaces()?, default_route_interface(proc_net).await?))
}

/// Keeps the node's interface annotations current so the controller can
/// resolve egress IPs on it.
pub async fn run_publisher(
    client: Client,
    node_name: String,
    proc_net: impl AsRef<Path>,
    refresh: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let api: Api<Node> = Api::all(client);
    let api = &api;
    let node_name = node_name.as_str();
    let proc_net = proc_net.as_ref();
    publish_changes(
        move || read_node_interfaces(proc_net),
        move |(interfaces, default_route): Observed| async move {
            publish(api, node_name, &interfaces, default_route.as_deref()).await
        },
        refresh,
        cancel,
    )
    .await;
    Ok(())
}

/// Publishes every change of the observed state until cancelled. Failed reads
/// and failed publishes are retried on the next tick.
async fn publish_changes<O, OF, P, PF>(
    mut observe: O,
    mut publish: P,
    refresh: Duration,
    cancel: CancellationToken,
) where
    O: FnMut() -> OF,
    OF: Future<Output = Result<Observed>>,
    P: FnMut(Observed) -> PF,
    PF: Future<Output = Result<()>>,
{
    let mut published: Option<Observed> = None;
    loop {
        match observe().await {
            Ok(current) if published.as_ref() != Some(&current) => {
                match publish(current.clone()).await {
                    Ok(()) => {
                        info!(
                            interfaces = current.0.len(),
                            default_route = ?current.1,
                            "published node interfaces"
                        );
                        published = Some(current);
                    }
                    Err(e) => warn!(%e, "failed to publish node interfaces"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%e, "failed to read node interfaces"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(refresh) => {}
        }
    }
}
