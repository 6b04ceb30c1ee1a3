use std::cmp::Ordering;
use std::net::IpAddr;

use egress_gateway_crds::v1alpha1::policy::EgressGatewayPolicy;
use ipnetwork::IpNetwork;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::core::Selector;

use crate::cidr::PolicyCidrs;
use crate::egress_ip::EgressIpSource;
use crate::error::ResolutionError;
use crate::selector::{CompiledRule, compile_selector};

/// Tie-break between policies installing the same row: earliest creation
/// first (unknown creation last), then name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyOrder {
    pub created: Option<DateTime<Utc>>,
    pub name: String,
}

impl Ord for PolicyOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        let created = match (&self.created, &other.created) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        created.then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for PolicyOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub node_selector: Selector,
    pub egress: EgressIpSource,
}

/// A validated policy. Compilation fails on any configuration error so a
/// broken policy never produces rows.
#[derive(Clone, Debug)]
pub struct CompiledPolicy {
    pub name: String,
    pub generation: i64,
    pub order: PolicyOrder,
    pub rules: Vec<CompiledRule>,
    pub cidrs: PolicyCidrs,
    pub gateways: Vec<GatewayConfig>,
}

fn parse_cidr(cidr: &str) -> Result<IpNetwork, ResolutionError> {
    let parsed: IpNetwork = cidr.trim().parse().map_err(|e: ipnetwork::IpNetworkError| {
        ResolutionError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: e.to_string(),
        }
    })?;
    IpNetwork::new(parsed.network(), parsed.prefix()).map_err(|e| ResolutionError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: e.to_string(),
    })
}

pub fn compile_policy(policy: &EgressGatewayPolicy) -> Result<CompiledPolicy, ResolutionError> {
    let spec = &policy.spec;
    if spec.destination_cidrs.is_empty() {
        return Err(ResolutionError::MissingDestinationCidrs);
    }
    let cidrs = PolicyCidrs {
        destinations: spec
            .destination_cidrs
            .iter()
            .map(|cidr| parse_cidr(cidr))
            .collect::<Result<_, _>>()?,
        excluded: spec
            .excluded_cidrs
            .iter()
            .map(|cidr| parse_cidr(cidr))
            .collect::<Result<_, _>>()?,
    };

    let rules = spec
        .selectors
        .iter()
        .map(CompiledRule::compile)
        .collect::<Result<_, _>>()?;

    let mut gateways = Vec::new();
    for (index, gateway) in spec.gateways().iter().enumerate() {
        let egress = match (&gateway.egress_ip, &gateway.interface) {
            (Some(_), Some(_)) => {
                return Err(ResolutionError::ConflictingEgressIPConfig { index });
            }
            (Some(ip), None) => {
                let ip: IpAddr =
                    ip.trim()
                        .parse()
                        .map_err(|e: std::net::AddrParseError| {
                            ResolutionError::InvalidGatewayConfig {
                                index,
                                reason: format!("egressIP {ip}: {e}"),
                            }
                        })?;
                EgressIpSource::Address(ip)
            }
            (None, Some(interface)) if interface.is_empty() => {
                return Err(ResolutionError::InvalidGatewayConfig {
                    index,
                    reason: "interface must not be empty".into(),
                });
            }
            (None, Some(interface)) => EgressIpSource::Interface(interface.clone()),
            (None, None) => EgressIpSource::DefaultRoute,
        };
        gateways.push(GatewayConfig {
            node_selector: compile_selector(&gateway.node_selector)?,
            egress,
        });
    }

    let name = policy.name_any();
    Ok(CompiledPolicy {
        order: PolicyOrder {
            created: policy.creation_timestamp().map(|time| time.0),
            name: name.clone(),
        },
        name,
        generation: policy.metadata.generation.unwrap_or_default(),
        rules,
        cidrs,
        gateways,
    })
}

#[cfg(test)]
mod tests {
    use egress_gateway_crds::v1alpha1::policy::{EgressGateway, EgressGatewayPolicySpec, EgressRule};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    use super::*;
    use crate::fixtures::make_selector;

    fn make_gateway(egress_ip: Option<&str>, interface: Option<&str>) -> EgressGateway {
        EgressGateway {
            node_selector: make_selector("kubernetes.io/hostname", "node2"),
            egress_ip: egress_ip.map(Into::into),
            interface: interface.map(Into::into),
        }
    }

    fn make_policy(destinations: &[&str], gateways: Vec<EgressGateway>) -> EgressGatewayPolicy {
        let mut policy = EgressGatewayPolicy::new(
            "egress-mediabot",
            EgressGatewayPolicySpec {
                selectors: vec![EgressRule {
                    pod_selector: make_selector("app", "mediabot"),
                    node_selector: None,
                }],
                destination_cidrs: destinations.iter().map(|d| d.to_string()).collect(),
                egress_gateways: gateways,
                ..Default::default()
            },
        );
        policy.metadata.generation = Some(3);
        policy
    }

    #[test]
    fn test_compile_policy() {
        let policy = make_policy(
            &["0.0.0.0/0", "10.1.2.3/16"],
            vec![
                make_gateway(Some("10.168.60.100"), None),
                make_gateway(None, Some("eth1")),
                make_gateway(None, None),
            ],
        );
        let compiled = compile_policy(&policy).expect("valid policy");

        assert_eq!(compiled.name, "egress-mediabot");
        assert_eq!(compiled.generation, 3);
        assert_eq!(compiled.order.created, None);
        assert_eq!(
            compiled.cidrs.destinations,
            vec![
                "0.0.0.0/0".parse::<IpNetwork>().unwrap(),
                "10.1.0.0/16".parse::<IpNetwork>().unwrap()
            ]
        );
        let sources: Vec<EgressIpSource> =
            compiled.gateways.iter().map(|g| g.egress.clone()).collect();
        assert_eq!(
            sources,
            vec![
                EgressIpSource::Address("10.168.60.100".parse().unwrap()),
                EgressIpSource::Interface("eth1".into()),
                EgressIpSource::DefaultRoute,
            ]
        );
    }

    #[test]
    fn test_conflicting_egress_config() {
        let policy = make_policy(
            &["0.0.0.0/0"],
            vec![make_gateway(None, None), make_gateway(Some("10.168.60.100"), Some("eth1"))],
        );
        assert_eq!(
            compile_policy(&policy).unwrap_err(),
            ResolutionError::ConflictingEgressIPConfig { index: 1 }
        );
    }

    #[test]
    fn test_configuration_errors() {
        let empty = make_policy(&[], vec![make_gateway(None, None)]);
        assert_eq!(
            compile_policy(&empty).unwrap_err(),
            ResolutionError::MissingDestinationCidrs
        );

        let bad_cidr = make_policy(&["10.0.0.0/40"], vec![]);
        assert_eq!(compile_policy(&bad_cidr).unwrap_err().reason(), "InvalidCidr");

        let bad_ip = make_policy(&["0.0.0.0/0"], vec![make_gateway(Some("not-an-ip"), None)]);
        assert_eq!(compile_policy(&bad_ip).unwrap_err().reason(), "InvalidGatewayConfig");

        let mut bad_selector = make_policy(&["0.0.0.0/0"], vec![]);
        bad_selector.spec.selectors[0].pod_selector.match_expressions =
            Some(vec![LabelSelectorRequirement {
                key: "app".into(),
                operator: "In".into(),
                values: None,
            }]);
        assert_eq!(
            compile_policy(&bad_selector).unwrap_err().reason(),
            "SelectorResolutionError"
        );
    }

    #[test]
    fn test_policy_order() {
        use k8s_openapi::chrono::TimeZone;

        let early = PolicyOrder {
            created: Utc.timestamp_opt(10, 0).single(),
            name: "b".into(),
        };
        let late = PolicyOrder {
            created: Utc.timestamp_opt(20, 0).single(),
            name: "a".into(),
        };
        let unknown = PolicyOrder {
            created: None,
            name: "0".into(),
        };
        let mut orders = vec![unknown.clone(), late.clone(), early.clone()];
        orders.sort();
        assert_eq!(orders, vec![early, late, unknown]);
    }
}
