//! Immutable view of the cluster used by one reconciliation pass.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use egress_gateway_common::{DEFAULT_ROUTE_INTERFACE_ANNOTATION, INTERFACES_ANNOTATION, NodeInterfaces};
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::warn;

use crate::cidr::covers;

/// Pseudo-label carrying the pod's namespace, usable in pod selectors.
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub uid: String,
    pub name: String,
    pub ips: Vec<IpAddr>,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
}

impl Endpoint {
    /// Returns None for pods that cannot originate egress traffic: host
    /// network, terminating, finished, unscheduled or without an address.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let spec = pod.spec.as_ref()?;
        if spec.host_network == Some(true) || pod.metadata.deletion_timestamp.is_some() {
            return None;
        }
        let status = pod.status.as_ref()?;
        if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
            return None;
        }

        let mut ips: Vec<IpAddr> = status
            .pod_ips
            .iter()
            .flatten()
            .filter_map(|pod_ip| pod_ip.ip.parse().ok())
            .collect();
        if ips.is_empty()
            && let Some(ip) = status.pod_ip.as_ref().and_then(|ip| ip.parse().ok())
        {
            ips.push(ip);
        }
        if ips.is_empty() {
            return None;
        }

        let mut labels = pod.labels().clone();
        labels.insert(POD_NAMESPACE_LABEL.into(), pod.namespace().unwrap_or_default());

        Some(Self {
            uid: pod.uid()?,
            name: format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()),
            ips,
            node_name: spec.node_name.clone()?,
            labels,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayNode {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub interfaces: NodeInterfaces,
    pub default_route_interface: Option<String>,
    pub internal_ips: Vec<IpAddr>,
    pub addresses: Vec<IpAddr>,
    pub pod_cidrs: Vec<IpNetwork>,
}

impl GatewayNode {
    pub fn from_node(node: &Node) -> Self {
        let name = node.name_any();
        let annotations = node.annotations();
        let interfaces = annotations
            .get(INTERFACES_ANNOTATION)
            .and_then(|raw| match serde_json::from_str::<NodeInterfaces>(raw) {
                Ok(interfaces) => Some(interfaces),
                Err(e) => {
                    warn!(%e, node = %name, "ignoring malformed interfaces annotation");
                    None
                }
            })
            .unwrap_or_default();
        let default_route_interface = annotations
            .get(DEFAULT_ROUTE_INTERFACE_ANNOTATION)
            .filter(|iface| !iface.is_empty())
            .cloned();

        let mut internal_ips = Vec::new();
        let mut addresses = Vec::new();
        for address in node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .into_iter()
            .flatten()
        {
            let Ok(ip) = address.address.parse::<IpAddr>() else {
                continue;
            };
            if address.type_ == "InternalIP" {
                internal_ips.push(ip);
            }
            addresses.push(ip);
        }

        let spec = node.spec.as_ref();
        let pod_cidrs = spec
            .and_then(|spec| spec.pod_cidrs.clone())
            .filter(|cidrs| !cidrs.is_empty())
            .or_else(|| spec.and_then(|spec| spec.pod_cidr.clone()).map(|cidr| vec![cidr]))
            .unwrap_or_default()
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect();

        Self {
            name,
            labels: node.labels().clone(),
            interfaces,
            default_route_interface,
            internal_ips,
            addresses,
            pod_cidrs,
        }
    }

    /// Internal IP that other nodes use to reach this one, preferring the
    /// family of `source`.
    pub fn internal_ip_for(&self, source: &IpAddr) -> Option<IpAddr> {
        self.internal_ips
            .iter()
            .find(|ip| ip.is_ipv4() == source.is_ipv4())
            .or_else(|| self.internal_ips.first())
            .copied()
    }
}

pub trait ClusterAddressClassifier {
    fn is_cluster_internal(&self, ip: &IpAddr) -> bool;

    /// True when the whole network lies inside cluster-internal space.
    fn is_internal_network(&self, _network: &IpNetwork) -> bool {
        false
    }
}

/// Pod IPs, node addresses, node pod CIDRs and operator configured ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalAddresses {
    ips: BTreeSet<IpAddr>,
    networks: Vec<IpNetwork>,
}

impl InternalAddresses {
    pub fn new(
        ips: impl IntoIterator<Item = IpAddr>,
        networks: impl IntoIterator<Item = IpNetwork>,
    ) -> Self {
        Self {
            ips: ips.into_iter().collect(),
            networks: networks.into_iter().collect(),
        }
    }
}

impl ClusterAddressClassifier for InternalAddresses {
    fn is_cluster_internal(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip) || self.networks.iter().any(|net| net.contains(*ip))
    }

    fn is_internal_network(&self, network: &IpNetwork) -> bool {
        self.networks.iter().any(|net| covers(net, network))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub version: u64,
    /// Sorted by uid
    pub endpoints: Vec<Endpoint>,
    pub nodes: BTreeMap<String, GatewayNode>,
    pub internal: InternalAddresses,
}

impl ClusterSnapshot {
    pub fn new(
        version: u64,
        mut endpoints: Vec<Endpoint>,
        nodes: impl IntoIterator<Item = GatewayNode>,
        internal_cidrs: &[IpNetwork],
    ) -> Self {
        endpoints.sort_by(|a, b| a.uid.cmp(&b.uid));
        endpoints.dedup_by(|a, b| a.uid == b.uid);
        let nodes: BTreeMap<String, GatewayNode> = nodes
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();

        let ips = endpoints
            .iter()
            .flat_map(|ep| ep.ips.iter().copied())
            .chain(nodes.values().flat_map(|node| node.addresses.iter().copied()));
        let networks = nodes
            .values()
            .flat_map(|node| node.pod_cidrs.iter().copied())
            .chain(internal_cidrs.iter().copied());
        let internal = InternalAddresses::new(ips, networks);

        Self {
            version,
            endpoints,
            nodes,
            internal,
        }
    }

    pub fn from_objects<'a>(
        version: u64,
        pods: impl IntoIterator<Item = &'a Pod>,
        nodes: impl IntoIterator<Item = &'a Node>,
        internal_cidrs: &[IpNetwork],
    ) -> Self {
        let endpoints = pods.into_iter().filter_map(Endpoint::from_pod).collect();
        let nodes = nodes.into_iter().map(GatewayNode::from_node);
        Self::new(version, endpoints, nodes, internal_cidrs)
    }
}
