use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use kube::{Api, Client};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::kubernetes::{Inventory, Trigger, create_store};
use crate::metrics::{ControllerMetrics, get_trace_id};
use crate::reconciler::Reconciler;
use crate::status::StatusWriter;
use crate::{Error, NodeTables, Result};

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Service and API server ranges that never leave through a gateway
    pub internal_cidrs: Vec<IpNetwork>,
    pub resync_interval: Duration,
    pub store_timeout: Duration,
    /// Quiet period after a change before a pass starts
    pub debounce: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            internal_cidrs: Vec::new(),
            resync_interval: Duration::from_secs(300),
            store_timeout: Duration::from_secs(30),
            debounce: Duration::from_millis(250),
        }
    }
}

/// Watches pods, nodes and policies and runs a reconciliation pass whenever
/// any of them change, or every resync interval. Passes never overlap.
pub async fn start_egress_controller<T: NodeTables>(
    client: Client,
    reconciler: Arc<Reconciler<T>>,
    settings: ControllerSettings,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let metrics = ControllerMetrics::new("egress-gateway");
    let trigger = Arc::new(Trigger::default());
    let store_timeout = settings.store_timeout;
    let store_init = timeout(store_timeout, async {
        tokio::try_join!(
            create_store(Api::all(client.clone()), Arc::clone(&trigger), store_timeout),
            create_store(Api::all(client.clone()), Arc::clone(&trigger), store_timeout),
            create_store(Api::all(client.clone()), Arc::clone(&trigger), store_timeout),
        )
    })
    .await
    .map_err(|_| Error::Timeout("store initialization".into()))
    .and_then(|stores| stores)
    .inspect_err(|e| {
        error!(%e, "failed to initialize stores");
        metrics.count_failure(e);
    })?;

    let (pods, nodes, policies) = store_init;
    let inventory = Inventory {
        pods,
        nodes,
        policies,
        trigger: Arc::clone(&trigger),
        internal_cidrs: settings.internal_cidrs.clone(),
    };
    let status = StatusWriter::new(client);

    ready.cancel();
    info!("egress gateway controller started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("egress gateway controller shutting down");
                return Ok(());
            }
            _ = trigger.notified() => {}
            _ = tokio::time::sleep(settings.resync_interval) => {
                debug!("periodic resync");
            }
        }
        tokio::time::sleep(settings.debounce).await;

        let snapshot = Arc::new(inventory.snapshot());
        let policies = inventory.policies();
        let trace_id = get_trace_id();
        let report = {
            let _measure = metrics.count_and_measure(&trace_id);
            reconciler.run_pass(snapshot, &policies).await
        };
        metrics.record(&report);
        status.publish(&policies, &report).await;
    }
}
