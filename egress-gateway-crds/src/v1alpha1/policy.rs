use std::fmt::Display;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::{JsonSchema, json_schema};
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_EGRESS_GATEWAY_POLICY: &str =
    "egressgatewaypolicies.egress-gateway.mesh-cni.dev";

/// Routes traffic from the selected pods to the destination CIDRs through one or
/// more gateway nodes, source-NATed to the gateway's egress IP.
#[derive(CustomResource, Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[kube(
    group = "egress-gateway.mesh-cni.dev",
    version = "v1alpha1",
    kind = "EgressGatewayPolicy",
    shortname = "egp",
    status = "EgressGatewayPolicyStatus",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewayPolicySpec {
    /// Pods matched by any of the entries are subject to the policy
    pub selectors: Vec<EgressRule>,

    /// Destinations that are routed through the gateway
    #[serde(rename = "destinationCIDRs")]
    pub destination_cidrs: Vec<String>,

    /// Destinations that are never routed through the gateway, even when
    /// covered by a destination CIDR
    #[serde(
        default,
        rename = "excludedCIDRs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub excluded_cidrs: Vec<String>,

    /// Single gateway. Ignored when `egressGateways` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_gateway: Option<EgressGateway>,

    /// Ordered gateways the selected pods are spread across
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_gateways: Vec<EgressGateway>,
}

impl EgressGatewayPolicySpec {
    /// Gateways in effect for this policy, in declaration order.
    pub fn gateways(&self) -> &[EgressGateway] {
        if !self.egress_gateways.is_empty() {
            return &self.egress_gateways;
        }
        self.egress_gateway.as_slice()
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    #[schemars(schema_with = "label_selector")]
    pub pod_selector: LabelSelector,

    /// Restricts the rule to pods scheduled on matching nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "label_selector")]
    pub node_selector: Option<LabelSelector>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressGateway {
    #[schemars(schema_with = "label_selector")]
    pub node_selector: LabelSelector,

    /// Address that must be bound to an interface of the gateway node
    #[serde(default, rename = "egressIP", skip_serializing_if = "Option::is_none")]
    pub egress_ip: Option<String>,

    /// Interface whose first IPv4/IPv6 address is used as egress IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Copy, Debug, JsonSchema)]
pub enum PolicyState {
    #[default]
    Pending,
    Resolved,
    Installed,
    Failed,
}

impl Display for PolicyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyState::Pending => write!(f, "Pending"),
            PolicyState::Resolved => write!(f, "Resolved"),
            PolicyState::Installed => write!(f, "Installed"),
            PolicyState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewayPolicyStatus {
    #[serde(default)]
    pub state: PolicyState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Gateway nodes currently serving the policy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateway_nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "conditions")]
    pub conditions: Vec<Condition>,
}

fn conditions(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    })
}

fn label_selector(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "type": "object",
        "properties": {
            "matchLabels": {
                "type": "object",
                "additionalProperties": { "type": "string" }
            },
            "matchExpressions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "operator": { "type": "string" },
                        "values": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["key", "operator"]
                }
            }
        }
    })
}
