use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use egress_gateway_common::{EntryKey, EntryValue, GatewayTarget, unspecified_like};
use ipnetwork::IpNetwork;

use crate::assignment::assign_gateway;
use crate::cidr::{PolicyCidrs, select_policy, select_route};
use crate::egress_ip::{EgressAddresses, resolve_egress_ip};
use crate::error::ResolutionError;
use crate::policy::{CompiledPolicy, PolicyOrder};
use crate::selector::{resolve_endpoints, resolve_gateway_nodes};
use crate::snapshot::{ClusterSnapshot, Endpoint};

/// Desired table per node name.
pub type NodeTable = BTreeMap<EntryKey, EntryValue>;

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayResolution {
    pub node: String,
    pub egress: Result<EgressAddresses, ResolutionError>,
}

/// Outcome of resolving one policy against a snapshot.
#[derive(Clone, Debug)]
pub struct PolicyResolution {
    pub name: String,
    pub generation: i64,
    pub order: PolicyOrder,
    pub cidrs: PolicyCidrs,
    pub endpoints: Vec<Endpoint>,
    pub gateways: Vec<GatewayResolution>,
    /// Endpoint uid to index in `gateways`
    pub assignments: BTreeMap<String, usize>,
}

impl PolicyResolution {
    pub fn gateway_for(&self, endpoint_uid: &str) -> Option<&GatewayResolution> {
        self.assignments
            .get(endpoint_uid)
            .and_then(|idx| self.gateways.get(*idx))
    }

    /// Gateways that serve at least one endpoint.
    pub fn gateways_in_use(&self) -> impl Iterator<Item = &GatewayResolution> {
        let used: BTreeSet<usize> = self.assignments.values().copied().collect();
        self.gateways
            .iter()
            .enumerate()
            .filter(move |(idx, _)| used.contains(idx))
            .map(|(_, gateway)| gateway)
    }

    /// Non-fatal problems: the policy installs but some traffic drops.
    pub fn warnings(&self) -> Vec<ResolutionError> {
        if self.gateways.is_empty() {
            return vec![ResolutionError::NoMatchingGatewayNode];
        }
        self.gateways_in_use()
            .filter_map(|gateway| gateway.egress.as_ref().err().cloned())
            .collect()
    }

    /// Gateway serving `source`, when a selected endpoint owns the address
    /// and has been assigned one.
    pub fn gateway_for_source(&self, source: &IpAddr) -> Option<&GatewayResolution> {
        self.endpoints
            .iter()
            .filter(|ep| ep.ips.contains(source))
            .find_map(|ep| self.gateway_for(&ep.uid))
    }
}

/// Egress addresses pinned per (policy, gateway node) for one policy
/// generation. Only successful resolutions are pinned.
#[derive(Debug, Default)]
pub struct EgressPins {
    pins: BTreeMap<(String, String), (i64, EgressAddresses)>,
}

impl EgressPins {
    pub fn for_policy(&self, policy: &str, generation: i64) -> BTreeMap<String, EgressAddresses> {
        self.pins
            .iter()
            .filter(|((name, _), (pinned_generation, _))| {
                name == policy && *pinned_generation == generation
            })
            .map(|((_, node), (_, addresses))| (node.clone(), *addresses))
            .collect()
    }

    pub fn record(&mut self, resolution: &PolicyResolution) {
        self.pins.retain(|(name, node), _| {
            name != &resolution.name || resolution.gateways.iter().any(|gw| &gw.node == node)
        });
        for gateway in &resolution.gateways {
            if let Ok(addresses) = &gateway.egress {
                self.pins.insert(
                    (resolution.name.clone(), gateway.node.clone()),
                    (resolution.generation, *addresses),
                );
            }
        }
    }

    pub fn retain_policies(&mut self, policies: &BTreeSet<String>) {
        self.pins.retain(|(name, _), _| policies.contains(name));
    }
}

/// Resolves endpoints, gateway nodes, egress addresses and assignments.
/// `pinned` holds addresses previously resolved for this policy generation.
pub fn resolve_policy(
    policy: &CompiledPolicy,
    snapshot: &ClusterSnapshot,
    pinned: &BTreeMap<String, EgressAddresses>,
) -> PolicyResolution {
    let endpoints = resolve_endpoints(&policy.rules, snapshot);

    let selectors: Vec<_> = policy.gateways.iter().map(|gw| &gw.node_selector).collect();
    let gateways: Vec<GatewayResolution> = resolve_gateway_nodes(&selectors, &snapshot.nodes)
        .into_iter()
        .map(|(idx, node)| {
            let egress = match pinned.get(&node.name) {
                Some(addresses) => Ok(*addresses),
                None => resolve_egress_ip(node, &policy.gateways[idx].egress),
            };
            GatewayResolution {
                node: node.name.clone(),
                egress,
            }
        })
        .collect();

    let names: Vec<&str> = gateways.iter().map(|gw| gw.node.as_str()).collect();
    let assignments = endpoints
        .iter()
        .filter_map(|ep| assign_gateway(&ep.uid, &names).map(|idx| (ep.uid.clone(), idx)))
        .collect();

    PolicyResolution {
        name: policy.name.clone(),
        generation: policy.generation,
        order: policy.order.clone(),
        cidrs: policy.cidrs.clone(),
        endpoints: endpoints.into_iter().cloned().collect(),
        gateways,
        assignments,
    }
}

/// Policy that decides how traffic from `source` to `destination` leaves the
/// cluster, if any.
pub fn matching_policy<'a>(
    resolutions: &'a [PolicyResolution],
    source: &IpAddr,
    destination: &IpAddr,
    snapshot: &ClusterSnapshot,
) -> Option<&'a PolicyResolution> {
    select_policy(
        resolutions
            .iter()
            .filter(|res| res.gateway_for_source(source).is_some())
            .map(|res| (&res.cidrs, &res.order, res)),
        destination,
        &snapshot.internal,
    )
}

struct Row<'a> {
    gateway_node: Option<&'a str>,
    egress_ip: Option<IpAddr>,
    gateway: GatewayTarget,
}

impl<'a> Row<'a> {
    fn through(gateway: &'a GatewayResolution, source: &IpAddr, snapshot: &ClusterSnapshot) -> Self {
        let gateway_ip = snapshot
            .nodes
            .get(&gateway.node)
            .and_then(|node| node.internal_ip_for(source))
            .unwrap_or_else(|| unspecified_like(source));
        Self {
            gateway_node: Some(gateway.node.as_str()),
            egress_ip: gateway
                .egress
                .as_ref()
                .ok()
                .and_then(|addresses| addresses.for_family(source)),
            gateway: GatewayTarget::Node(gateway_ip),
        }
    }

    fn excluded() -> Self {
        Self {
            gateway_node: None,
            egress_ip: None,
            gateway: GatewayTarget::Excluded,
        }
    }
}

/// Desired table of every node in the snapshot. Rows are identical on all
/// nodes except for the egress IP, which only the gateway itself carries.
///
/// Keys are the destination and exclusion CIDRs of every policy serving a
/// source. Each key goes to the policy routing the whole key with the longest
/// destination prefix, then the earliest policy order. A key no policy routes
/// becomes an excluded row.
pub fn desired_tables(
    resolutions: &[PolicyResolution],
    snapshot: &ClusterSnapshot,
) -> BTreeMap<String, NodeTable> {
    let sources: BTreeSet<IpAddr> = resolutions
        .iter()
        .flat_map(|res| res.endpoints.iter())
        .flat_map(|ep| ep.ips.iter().copied())
        .collect();

    let mut rows: BTreeMap<EntryKey, Row> = BTreeMap::new();
    for source in &sources {
        let candidates: Vec<(&PolicyResolution, &GatewayResolution)> = resolutions
            .iter()
            .filter_map(|res| res.gateway_for_source(source).map(|gateway| (res, gateway)))
            .collect();
        let destinations: BTreeSet<IpNetwork> = candidates
            .iter()
            .flat_map(|(res, _)| res.cidrs.expand(source, &snapshot.internal))
            .map(|(destination, _)| destination)
            .collect();

        for destination in destinations {
            let winner = select_route(
                candidates
                    .iter()
                    .map(|&(res, gateway)| (&res.cidrs, &res.order, gateway)),
                &destination,
                &snapshot.internal,
            );
            let row = match winner {
                Some(gateway) => Row::through(gateway, source, snapshot),
                None => Row::excluded(),
            };
            let key = EntryKey {
                source_ip: *source,
                destination_cidr: destination,
            };
            rows.insert(key, row);
        }
    }

    snapshot
        .nodes
        .keys()
        .map(|node| {
            let table = rows
                .iter()
                .map(|(key, row)| {
                    let egress_ip = row
                        .egress_ip
                        .filter(|_| row.gateway_node == Some(node.as_str()));
                    (
                        *key,
                        EntryValue {
                            egress_ip,
                            gateway: row.gateway,
                        },
                    )
                })
                .collect();
            (node.clone(), table)
        })
        .collect()
}
