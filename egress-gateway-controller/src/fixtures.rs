use std::collections::BTreeMap;

use egress_gateway_common::{DEFAULT_ROUTE_INTERFACE_ANNOTATION, INTERFACES_ANNOTATION};
use egress_gateway_crds::v1alpha1::policy::{
    EgressGateway, EgressGatewayPolicy, EgressGatewayPolicySpec, EgressRule,
};
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeSpec, NodeStatus, Pod, PodIP, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use crate::snapshot::ClusterSnapshot;

pub(crate) const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub(crate) fn make_selector(key: &str, value: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    }
}

pub(crate) fn make_pod(name: &str, node: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            uid: Some(format!("uid-{name}")),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.into()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            pod_ips: Some(vec![PodIP { ip: ip.into() }]),
            ..Default::default()
        }),
    }
}

/// Node whose default route uses the first listed interface.
pub(crate) fn make_node(name: &str, internal_ip: &str, interfaces: &[(&str, &[&str])]) -> Node {
    let interface_map: BTreeMap<&str, &[&str]> = interfaces.iter().copied().collect();
    let mut annotations = BTreeMap::from([(
        INTERFACES_ANNOTATION.to_string(),
        serde_json::to_string(&interface_map).unwrap_or_default(),
    )]);
    if let Some((default_iface, _)) = interfaces.first() {
        annotations.insert(
            DEFAULT_ROUTE_INTERFACE_ANNOTATION.to_string(),
            default_iface.to_string(),
        );
    }
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), name.to_string())])),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                address: internal_ip.into(),
                type_: "InternalIP".into(),
            }]),
            ..Default::default()
        }),
    }
}

pub(crate) fn make_snapshot(pods: Vec<Pod>, nodes: Vec<Node>) -> ClusterSnapshot {
    ClusterSnapshot::from_objects(1, &pods, &nodes, &[])
}

pub(crate) fn make_gateway(
    node: &str,
    egress_ip: Option<&str>,
    interface: Option<&str>,
) -> EgressGateway {
    EgressGateway {
        node_selector: make_selector(HOSTNAME_LABEL, node),
        egress_ip: egress_ip.map(Into::into),
        interface: interface.map(Into::into),
    }
}

/// Policy selecting `app=mediabot` pods.
pub(crate) fn make_policy(
    name: &str,
    destinations: &[&str],
    gateways: Vec<EgressGateway>,
) -> EgressGatewayPolicy {
    EgressGatewayPolicy::new(
        name,
        EgressGatewayPolicySpec {
            selectors: vec![EgressRule {
                pod_selector: make_selector("app", "mediabot"),
                node_selector: None,
            }],
            destination_cidrs: destinations.iter().map(|d| d.to_string()).collect(),
            egress_gateways: gateways,
            ..Default::default()
        },
    )
}

/// Single gateway on node2 with egress IP 10.168.60.100.
pub(crate) fn mediabot_policy() -> EgressGatewayPolicy {
    let mut policy = make_policy("egress-mediabot", &["0.0.0.0/0"], vec![]);
    policy.spec.egress_gateway = Some(make_gateway("node2", Some("10.168.60.100"), None));
    policy
}
