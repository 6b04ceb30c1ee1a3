pub mod interfaces;
pub mod metrics;
pub mod table;

use std::sync::{Arc, PoisonError};

use egress_gateway_common::{EntryKey, EntryValue, PolicyEntry, TableDiff};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::agent::metrics::TableMetrics;
use crate::agent::table::{ApplySummary, NodeTable, TableMap, TableState};
use crate::config::AgentArgs;
use crate::{Result, http, join_result};

/// Egress table of the local node.
pub struct Agent<M: TableMap<EntryKey, EntryValue>> {
    table: Mutex<NodeTable<M>>,
    metrics: TableMetrics,
}

impl<M: TableMap<EntryKey, EntryValue>> Agent<M> {
    pub fn try_new(map: M) -> Result<Self> {
        let table = TableState::try_new(map)?;
        let metrics = {
            let mut registry = crate::metrics::REGISTRY
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            TableMetrics::default().register(&mut registry)
        };
        metrics.entries.set(table.len() as i64);
        Ok(Self {
            table: Mutex::new(table),
            metrics,
        })
    }

    #[instrument(skip_all, fields(upserts = diff.upserts.len(), removals = diff.removals.len()))]
    pub async fn apply(&self, diff: &TableDiff) -> Result<ApplySummary> {
        let mut table = self.table.lock().await;
        let result = table.apply(diff);
        self.metrics.entries.set(table.len() as i64);
        match &result {
            Ok(summary) => {
                self.metrics.count("upsert", "success", summary.written);
                self.metrics.count("remove", "success", summary.removed);
                if summary.written + summary.removed > 0 {
                    info!(
                        written = summary.written,
                        removed = summary.removed,
                        "updated egress table"
                    );
                }
            }
            Err(e) => {
                self.metrics.count("apply", "failure", 1);
                error!(%e, "failed to update egress table");
            }
        }
        result
    }

    pub async fn entries(&self) -> Vec<PolicyEntry> {
        self.table.lock().await.entries()
    }
}

pub async fn start(args: AgentArgs, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let agent = Arc::new(Agent::try_new(ahash::HashMap::<EntryKey, EntryValue>::default())?);

    let mut server = tokio::spawn(http::agent::serve(
        args.listen_address,
        agent,
        ready.clone(),
        cancel.child_token(),
    ));
    let mut publisher = tokio::spawn(interfaces::run_publisher(
        client,
        args.node_name.clone(),
        args.proc_net.clone(),
        args.annotation_refresh,
        cancel.child_token(),
    ));
    ready.cancel();
    info!(node = %args.node_name, "egress gateway agent started");

    tokio::select! {
        h = &mut server => {
            cancel.cancel();
            let _ = publisher.await;
            join_result("server", h)
        }
        h = &mut publisher => {
            cancel.cancel();
            let _ = server.await;
            join_result("publisher", h)
        }
    }
}
