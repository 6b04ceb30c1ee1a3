pub mod assignment;
pub mod cidr;
pub mod egress_ip;
mod error;
mod kubernetes;
pub mod metrics;
pub mod policy;
pub mod reconciler;
pub mod resolve;
mod runtime;
pub mod selector;
pub mod snapshot;
mod status;

#[cfg(test)]
pub(crate) mod fixtures;

use std::future::Future;

use egress_gateway_common::{PolicyEntry, TableDiff};

pub use error::{Error, ResolutionError};
pub use reconciler::{NodeSyncOutcome, PassReport, PolicyReport, Reconciler, ReconcilerConfig, RetryPolicy};
pub use runtime::{ControllerSettings, start_egress_controller};

use crate::snapshot::GatewayNode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Programs the egress table of a single node.
pub trait NodeTables: Send + Sync + 'static {
    /// Applies the diff. Must be idempotent.
    fn apply(&self, node: &GatewayNode, diff: &TableDiff) -> impl Future<Output = Result<()>> + Send;

    /// Rows currently installed on the node.
    fn list(&self, node: &GatewayNode) -> impl Future<Output = Result<Vec<PolicyEntry>>> + Send;
}
