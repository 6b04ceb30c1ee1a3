use std::sync::Arc;

use egress_gateway_crds::v1alpha1::policy::{
    EgressGatewayPolicy, EgressGatewayPolicyStatus, PolicyState,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use crate::reconciler::{PassReport, PolicyReport};

const MANAGER: &str = "egress-gateway-controller";

pub(crate) const CONDITION_READY: &str = "Ready";
pub(crate) const CONDITION_GATEWAYS_SELECTED: &str = "GatewaysSelected";
pub(crate) const CONDITION_EGRESS_IP_RESOLVED: &str = "EgressIPResolved";

fn condition(
    type_: &str,
    ok: bool,
    reason: &str,
    message: String,
    generation: i64,
    current: Option<&EgressGatewayPolicyStatus>,
    now: &Time,
) -> Condition {
    let status = if ok { "True" } else { "False" };
    let last_transition_time = current
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.clone());
    Condition {
        type_: type_.into(),
        status: status.into(),
        reason: reason.into(),
        message,
        observed_generation: Some(generation),
        last_transition_time,
    }
}

/// Status for one policy after a pass. Transition times of conditions whose
/// status did not change are kept.
pub(crate) fn policy_status(
    report: &PolicyReport,
    current: Option<&EgressGatewayPolicyStatus>,
    now: &Time,
) -> EgressGatewayPolicyStatus {
    let generation = report.generation;
    let first_error = report.errors.first();
    let ready_reason = match (report.state, first_error) {
        (PolicyState::Installed, _) => "Installed",
        (_, Some(e)) => e.reason(),
        (PolicyState::Failed, None) => "Failed",
        (_, None) => "Pending",
    };
    let ready_message = match first_error {
        Some(e) => e.to_string(),
        None => format!("{} endpoints via {} gateways", report.endpoints, report.gateways.len()),
    };
    let mut conditions = vec![condition(
        CONDITION_READY,
        report.state == PolicyState::Installed,
        ready_reason,
        ready_message,
        generation,
        current,
        now,
    )];

    if report.state != PolicyState::Failed {
        let selected = !report.gateways.is_empty();
        conditions.push(condition(
            CONDITION_GATEWAYS_SELECTED,
            selected,
            if selected { "GatewaysSelected" } else { "NoMatchingGatewayNode" },
            report.gateways.join(","),
            generation,
            current,
            now,
        ));

        let unavailable: Vec<String> = report
            .errors
            .iter()
            .filter(|e| e.reason() == "NoEgressIPAvailable")
            .map(ToString::to_string)
            .collect();
        conditions.push(condition(
            CONDITION_EGRESS_IP_RESOLVED,
            unavailable.is_empty(),
            if unavailable.is_empty() { "EgressIPResolved" } else { "NoEgressIPAvailable" },
            unavailable.join("; "),
            generation,
            current,
            now,
        ));
    }

    EgressGatewayPolicyStatus {
        state: report.state,
        observed_generation: Some(generation),
        gateway_nodes: report.gateways.clone(),
        conditions,
    }
}

pub(crate) struct StatusWriter {
    api: Api<EgressGatewayPolicy>,
}

impl StatusWriter {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    pub async fn publish(&self, policies: &[Arc<EgressGatewayPolicy>], report: &PassReport) {
        let now = Time(Utc::now());
        for policy in policies {
            let name = policy.name_any();
            let Some(policy_report) = report.policies.get(&name) else {
                continue;
            };
            let status = policy_status(policy_report, policy.status.as_ref(), &now);
            if policy.status.as_ref() == Some(&status) {
                continue;
            }
            let patch = serde_json::json!({ "status": status });
            match self
                .api
                .patch_status(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => debug!(policy = %name, state = %status.state, "updated policy status"),
                Err(e) => warn!(%e, policy = %name, "failed to update policy status"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::{TimeZone, Utc};

    use super::*;
    use crate::ResolutionError;

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).single().unwrap())
    }

    fn report(state: PolicyState, errors: Vec<ResolutionError>, gateways: &[&str]) -> PolicyReport {
        PolicyReport {
            generation: 2,
            state,
            errors,
            endpoints: 1,
            gateways: gateways.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn find<'a>(status: &'a EgressGatewayPolicyStatus, type_: &str) -> &'a Condition {
        status
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .expect("condition present")
    }

    #[test]
    fn test_installed_status() {
        let status = policy_status(&report(PolicyState::Installed, vec![], &["node2"]), None, &at(10));
        assert_eq!(status.state, PolicyState::Installed);
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.gateway_nodes, vec!["node2"]);
        assert_eq!(find(&status, CONDITION_READY).status, "True");
        assert_eq!(find(&status, CONDITION_GATEWAYS_SELECTED).status, "True");
        assert_eq!(find(&status, CONDITION_EGRESS_IP_RESOLVED).status, "True");
    }

    #[test]
    fn test_failed_status() {
        let status = policy_status(
            &report(
                PolicyState::Failed,
                vec![ResolutionError::ConflictingEgressIPConfig { index: 0 }],
                &[],
            ),
            None,
            &at(10),
        );
        assert_eq!(status.conditions.len(), 1);
        let ready = find(&status, CONDITION_READY);
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "ConflictingEgressIPConfig");
    }

    #[test]
    fn test_egress_ip_unavailable_status() {
        let status = policy_status(
            &report(
                PolicyState::Resolved,
                vec![ResolutionError::NoEgressIPAvailable {
                    node: "node2".into(),
                    reason: "10.168.60.100 is not bound to any interface".into(),
                }],
                &["node2"],
            ),
            None,
            &at(10),
        );
        assert_eq!(find(&status, CONDITION_READY).reason, "NoEgressIPAvailable");
        let egress = find(&status, CONDITION_EGRESS_IP_RESOLVED);
        assert_eq!(egress.status, "False");
        assert!(egress.message.contains("node2"));
    }

    #[test]
    fn test_transition_time_kept_when_unchanged() {
        let installed = report(PolicyState::Installed, vec![], &["node2"]);
        let first = policy_status(&installed, None, &at(10));
        let second = policy_status(&installed, Some(&first), &at(20));
        assert_eq!(first, second);

        let broken = report(PolicyState::Resolved, vec![], &[]);
        let third = policy_status(&broken, Some(&second), &at(30));
        assert_eq!(find(&third, CONDITION_READY).last_transition_time, at(30));
        assert_eq!(
            find(&third, CONDITION_EGRESS_IP_RESOLVED).last_transition_time,
            at(10)
        );
    }
}
