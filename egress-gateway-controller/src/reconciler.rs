use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use egress_gateway_common::{PolicyEntry, TableDiff};
use egress_gateway_crds::v1alpha1::policy::{EgressGatewayPolicy, PolicyState};
use futures::future::join_all;
use kube::ResourceExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::egress_ip::EgressAddresses;
use crate::policy::{CompiledPolicy, compile_policy};
use crate::resolve::{EgressPins, NodeTable, PolicyResolution, desired_tables, resolve_policy};
use crate::snapshot::{ClusterSnapshot, GatewayNode};
use crate::{Error, NodeTables, ResolutionError, Result};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub resolve_timeout: Duration,
    pub push_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(10),
            push_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyReport {
    pub generation: i64,
    pub state: PolicyState,
    pub errors: Vec<ResolutionError>,
    pub endpoints: usize,
    pub gateways: Vec<String>,
}

impl PolicyReport {
    fn failed(generation: i64, error: ResolutionError) -> Self {
        Self {
            generation,
            state: PolicyState::Failed,
            errors: vec![error],
            endpoints: 0,
            gateways: Vec::new(),
        }
    }

    fn resolved(resolution: &PolicyResolution) -> Self {
        Self {
            generation: resolution.generation,
            state: PolicyState::Resolved,
            errors: resolution.warnings(),
            endpoints: resolution.endpoints.len(),
            gateways: resolution.gateways.iter().map(|gw| gw.node.clone()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeSyncOutcome {
    Unchanged,
    Programmed { upserts: usize, removals: usize },
    Failed(String),
}

/// Result of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassReport {
    pub version: u64,
    pub policies: BTreeMap<String, PolicyReport>,
    pub nodes: BTreeMap<String, NodeSyncOutcome>,
}

impl PassReport {
    pub fn failed_nodes(&self) -> impl Iterator<Item = (&String, &String)> {
        self.nodes.iter().filter_map(|(node, outcome)| match outcome {
            NodeSyncOutcome::Failed(reason) => Some((node, reason)),
            _ => None,
        })
    }
}

type Resolver =
    fn(&CompiledPolicy, &ClusterSnapshot, &BTreeMap<String, EgressAddresses>) -> PolicyResolution;

/// Turns snapshots and policies into node tables. Passes are serialized; the
/// last successfully installed table of each node is kept for diffing.
pub struct Reconciler<T: NodeTables> {
    tables: T,
    config: ReconcilerConfig,
    resolver: Resolver,
    pins: Mutex<EgressPins>,
    installed: RwLock<BTreeMap<String, NodeTable>>,
}

impl<T: NodeTables> Reconciler<T> {
    pub fn new(tables: T, config: ReconcilerConfig) -> Self {
        Self {
            tables,
            config,
            resolver: resolve_policy,
            pins: Mutex::new(EgressPins::default()),
            installed: RwLock::new(BTreeMap::new()),
        }
    }

    #[cfg(test)]
    fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Rows last installed successfully on `node`.
    pub async fn installed_entries(&self, node: &str) -> Option<Vec<PolicyEntry>> {
        let installed = self.installed.read().await;
        installed.get(node).map(|table| {
            table
                .iter()
                .map(|(key, value)| PolicyEntry::new(*key, *value))
                .collect()
        })
    }

    #[tracing::instrument(skip_all, fields(version = snapshot.version))]
    pub async fn run_pass(
        &self,
        snapshot: Arc<ClusterSnapshot>,
        policies: &[Arc<EgressGatewayPolicy>],
    ) -> PassReport {
        let mut pins = self.pins.lock().await;
        let names: BTreeSet<String> = policies.iter().map(|p| p.name_any()).collect();
        pins.retain_policies(&names);

        let mut report = PassReport {
            version: snapshot.version,
            ..Default::default()
        };

        let mut pending = Vec::new();
        for policy in policies {
            let generation = policy.metadata.generation.unwrap_or_default();
            let compiled = match compile_policy(policy) {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(%e, policy = %policy.name_any(), "invalid policy");
                    report
                        .policies
                        .insert(policy.name_any(), PolicyReport::failed(generation, e));
                    continue;
                }
            };
            let pinned = pins.for_policy(&compiled.name, compiled.generation);
            let snapshot = Arc::clone(&snapshot);
            let resolve_timeout = self.config.resolve_timeout;
            let resolver = self.resolver;
            pending.push(async move {
                let name = compiled.name.clone();
                let task =
                    tokio::task::spawn_blocking(move || resolver(&compiled, &snapshot, &pinned));
                let result = match tokio::time::timeout(resolve_timeout, task).await {
                    Ok(Ok(resolution)) => Ok(resolution),
                    Ok(Err(e)) => Err(ResolutionError::Aborted(e.to_string())),
                    Err(_) => Err(ResolutionError::ResolutionTimeout(resolve_timeout)),
                };
                (name, generation, result)
            });
        }

        let mut resolutions = Vec::new();
        for (name, generation, result) in join_all(pending).await {
            match result {
                Ok(resolution) => {
                    pins.record(&resolution);
                    report
                        .policies
                        .insert(name, PolicyReport::resolved(&resolution));
                    resolutions.push(resolution);
                }
                Err(e) => {
                    error!(%e, policy = %name, "policy resolution failed");
                    report
                        .policies
                        .insert(name, PolicyReport::failed(generation, e));
                }
            }
        }

        let desired = desired_tables(&resolutions, &snapshot);
        let syncs = desired.iter().filter_map(|(name, table)| {
            let node = snapshot.nodes.get(name)?;
            Some(async move { (name.clone(), self.sync_node(node, table).await) })
        });
        report.nodes = join_all(syncs).await.into_iter().collect();
        self.installed
            .write()
            .await
            .retain(|node, _| snapshot.nodes.contains_key(node));

        let failures: Vec<ResolutionError> = report
            .failed_nodes()
            .map(|(node, reason)| ResolutionError::TransientProgrammingFailure {
                node: node.clone(),
                reason: reason.clone(),
            })
            .collect();
        for policy in report.policies.values_mut() {
            if policy.state != PolicyState::Resolved {
                continue;
            }
            policy.errors.extend(failures.iter().cloned());
            if !policy.errors.iter().any(ResolutionError::blocks_install) {
                policy.state = PolicyState::Installed;
            }
        }

        info!(
            policies = report.policies.len(),
            nodes = report.nodes.len(),
            failed_nodes = failures.len(),
            "reconciliation pass complete"
        );
        report
    }

    #[tracing::instrument(skip(self, node, desired), fields(node = %node.name))]
    async fn sync_node(&self, node: &GatewayNode, desired: &NodeTable) -> NodeSyncOutcome {
        let known = self.installed.read().await.get(&node.name).cloned();
        let installed = match known {
            Some(table) => table,
            None => match self.with_retry(&node.name, || self.tables.list(node)).await {
                Ok(entries) => {
                    debug!(entries = entries.len(), "listed current node table");
                    entries.iter().map(|e| (e.key(), e.value())).collect()
                }
                Err(e) => {
                    error!(%e, "failed to list node table");
                    return NodeSyncOutcome::Failed(e.to_string());
                }
            },
        };

        let diff = TableDiff::between(&installed, desired);
        if diff.is_empty() {
            self.installed
                .write()
                .await
                .insert(node.name.clone(), installed);
            return NodeSyncOutcome::Unchanged;
        }

        match self
            .with_retry(&node.name, || self.tables.apply(node, &diff))
            .await
        {
            Ok(()) => {
                self.installed
                    .write()
                    .await
                    .insert(node.name.clone(), desired.clone());
                NodeSyncOutcome::Programmed {
                    upserts: diff.upserts.len(),
                    removals: diff.removals.len(),
                }
            }
            Err(e) => {
                error!(%e, "failed to program node table");
                // the node may hold a partial diff, relist it next pass
                self.installed.write().await.remove(&node.name);
                NodeSyncOutcome::Failed(e.to_string())
            }
        }
    }

    async fn with_retry<F, Fut, R>(&self, node: &str, op: F) -> Result<R>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.config.push_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("node {node}"))),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= retry.attempts.max(1) => return Err(e),
                Err(e) => {
                    let backoff = retry.backoff(attempt);
                    warn!(%e, attempt, ?backoff, "node table operation failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
