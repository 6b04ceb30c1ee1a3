use std::collections::BTreeMap;

use egress_gateway_crds::v1alpha1::policy::EgressRule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};

use crate::error::ResolutionError;
use crate::snapshot::{ClusterSnapshot, Endpoint, GatewayNode, POD_NAMESPACE_LABEL};

/// Source prefixes under which the namespace pseudo-label may be written.
const NAMESPACE_LABEL_PREFIXES: [&str; 2] = ["k8s:", "any:"];

/// Validates a selector and converts it to a typed kube `Selector`.
pub fn compile_selector(selector: &LabelSelector) -> Result<Selector, ResolutionError> {
    for req in selector.match_expressions.iter().flatten() {
        let invalid = |reason: &str| {
            ResolutionError::SelectorResolutionError(format!(
                "{} {}: {reason}",
                req.key, req.operator
            ))
        };
        if req.key.is_empty() {
            return Err(invalid("empty key"));
        }
        let has_values = req.values.as_ref().is_some_and(|values| !values.is_empty());
        match req.operator.as_str() {
            "In" | "NotIn" if !has_values => {
                return Err(invalid("operator requires values"));
            }
            "Exists" | "DoesNotExist" if has_values => {
                return Err(invalid("operator must not have values"));
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            _ => return Err(invalid("unknown operator")),
        }
    }
    Selector::try_from(selector.clone())
        .map_err(|e| ResolutionError::SelectorResolutionError(e.to_string()))
}

/// Like `compile_selector`, but accepts the namespace pseudo-label in its
/// `k8s:` and `any:` prefixed forms.
pub fn compile_pod_selector(selector: &LabelSelector) -> Result<Selector, ResolutionError> {
    let mut selector = selector.clone();
    if let Some(labels) = selector.match_labels.take() {
        selector.match_labels = Some(
            labels
                .into_iter()
                .map(|(key, value)| (namespace_label_key(key), value))
                .collect(),
        );
    }
    for req in selector.match_expressions.iter_mut().flatten() {
        req.key = namespace_label_key(std::mem::take(&mut req.key));
    }
    compile_selector(&selector)
}

fn namespace_label_key(key: String) -> String {
    let unprefixed = NAMESPACE_LABEL_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix));
    match unprefixed {
        Some(rest) if rest == POD_NAMESPACE_LABEL => rest.to_string(),
        _ => key,
    }
}

#[derive(Clone, Debug)]
pub struct CompiledRule {
    pub pod_selector: Selector,
    pub node_selector: Option<Selector>,
}

impl CompiledRule {
    pub fn compile(rule: &EgressRule) -> Result<Self, ResolutionError> {
        Ok(Self {
            pod_selector: compile_pod_selector(&rule.pod_selector)?,
            node_selector: rule.node_selector.as_ref().map(compile_selector).transpose()?,
        })
    }

    pub fn selects(&self, endpoint: &Endpoint, nodes: &BTreeMap<String, GatewayNode>) -> bool {
        if !self.pod_selector.matches(&endpoint.labels) {
            return false;
        }
        match &self.node_selector {
            None => true,
            Some(selector) => nodes
                .get(&endpoint.node_name)
                .is_some_and(|node| selector.matches(&node.labels)),
        }
    }
}

/// Endpoints selected by any of the rules, in snapshot (uid) order.
pub fn resolve_endpoints<'a>(
    rules: &[CompiledRule],
    snapshot: &'a ClusterSnapshot,
) -> Vec<&'a Endpoint> {
    snapshot
        .endpoints
        .iter()
        .filter(|endpoint| rules.iter().any(|rule| rule.selects(endpoint, &snapshot.nodes)))
        .collect()
}

/// Lexicographically first node matching the selector.
pub fn first_matching_node<'a>(
    selector: &Selector,
    nodes: &'a BTreeMap<String, GatewayNode>,
) -> Option<&'a GatewayNode> {
    nodes.values().find(|node| selector.matches(&node.labels))
}

/// One node per selector, in selector order. A node picked by an earlier
/// selector is not repeated.
pub fn resolve_gateway_nodes<'a>(
    selectors: &[&Selector],
    nodes: &'a BTreeMap<String, GatewayNode>,
) -> Vec<(usize, &'a GatewayNode)> {
    let mut resolved: Vec<(usize, &GatewayNode)> = Vec::new();
    for (idx, selector) in selectors.iter().enumerate() {
        let Some(node) = first_matching_node(selector, nodes) else {
            continue;
        };
        if resolved.iter().any(|(_, seen)| seen.name == node.name) {
            continue;
        }
        resolved.push((idx, node));
    }
    resolved
}
