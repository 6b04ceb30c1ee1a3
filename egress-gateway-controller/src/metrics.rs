use std::borrow::Cow;
use std::sync::{LazyLock, PoisonError, RwLock};

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::Error;
use crate::reconciler::{NodeSyncOutcome, PassReport};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("egress_gateway")));

const RESOURCE: &str = "egressgatewaypolicy";
const STATES: [&str; 4] = ["Pending", "Resolved", "Installed", "Failed"];

#[derive(Clone)]
pub struct ControllerMetrics {
    pub runs: Family<ControllerLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
    pub policy_state: Family<PolicyStateLabels, Gauge>,
    pub node_push_failures: Family<NodeLabels, Counter>,
}

impl ControllerMetrics {
    /// Register API metrics to start tracking them.
    pub fn new(controller_name: &str) -> Self {
        let mut guard = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        let registry = guard.sub_registry_with_label((
            Cow::Borrowed("controller_name"),
            Cow::Owned(controller_name.into()),
        ));
        let runs = Family::<ControllerLabels, Counter>::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration =
            HistogramWithExemplars::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter());
        let policy_state = Family::<PolicyStateLabels, Gauge>::default();
        let node_push_failures = Family::<NodeLabels, Counter>::default();

        registry.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            failures.clone(),
        );
        registry.register("reconcile_runs", "Number of reconciliations", runs.clone());
        registry.register(
            "policy_state",
            "Current state of each egress gateway policy",
            policy_state.clone(),
        );
        registry.register(
            "node_push_failures",
            "Number of failed node table updates",
            node_push_failures.clone(),
        );
        Self {
            runs,
            failures,
            duration,
            policy_state,
            node_push_failures,
        }
    }

    pub fn count_failure(&self, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                resource: RESOURCE.into(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs
            .get_or_create(&ControllerLabels {
                resource: RESOURCE.into(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }

    pub fn record(&self, report: &PassReport) {
        self.policy_state.clear();
        for (policy, policy_report) in &report.policies {
            for state in STATES {
                let value = i64::from(policy_report.state.to_string() == state);
                self.policy_state
                    .get_or_create(&PolicyStateLabels {
                        policy: policy.clone(),
                        state: state.into(),
                    })
                    .set(value);
            }
            for error in &policy_report.errors {
                self.failures
                    .get_or_create(&ErrorLabels {
                        resource: RESOURCE.into(),
                        error: error.reason().into(),
                    })
                    .inc();
            }
        }
        for (node, outcome) in &report.nodes {
            if matches!(outcome, NodeSyncOutcome::Failed(_)) {
                self.node_push_failures
                    .get_or_create(&NodeLabels { node: node.clone() })
                    .inc();
            }
        }
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        let labels = self.labels.take();
        self.metric.observe(duration, labels, None);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub resource: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyStateLabels {
    pub policy: String,
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub trace_id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = crate::Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::ConversionError(
                "failed to convert trace id to label".into(),
            ))
        } else {
            let trace_id = id.to_string();
            Ok(Self { trace_id })
        }
    }
}

pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}
