use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use egress_gateway_crds::v1alpha1::policy::EgressGatewayPolicy;
use futures::StreamExt;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::snapshot::ClusterSnapshot;
use crate::{Error, Result};

/// Coalescing change signal shared by all watchers. The generation doubles
/// as the snapshot version.
#[derive(Debug, Default)]
pub(crate) struct Trigger {
    generation: AtomicU64,
    notify: Notify,
}

impl Trigger {
    pub fn fire(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

pub(crate) async fn create_store<K>(
    api: Api<K>,
    trigger: Arc<Trigger>,
    timeout: Duration,
) -> Result<Store<K>>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + Sync + Hash + Clone,
{
    let (store, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .for_each(move |res| {
            match res {
                Ok(ev) => {
                    trace!("received event: {:?}", ev);
                    trigger.fire();
                }
                Err(e) => {
                    error!(%e, "unexpected error with stream")
                }
            }
            futures::future::ready(())
        });

    tokio::spawn(stream);
    tokio::time::timeout(timeout, store.wait_until_ready())
        .await
        .map_err(|_| Error::StoreCreation("timed out waiting for store".into()))?
        .map_err(|e| Error::StoreCreation(e.to_string()))?;
    Ok(store)
}

/// Watched cluster state the reconciler reads from.
pub(crate) struct Inventory {
    pub pods: Store<Pod>,
    pub nodes: Store<Node>,
    pub policies: Store<EgressGatewayPolicy>,
    pub trigger: Arc<Trigger>,
    pub internal_cidrs: Vec<IpNetwork>,
}

impl Inventory {
    pub fn snapshot(&self) -> ClusterSnapshot {
        // read before the stores so a concurrent change bumps the next version
        let version = self.trigger.generation();
        let pods = self.pods.state();
        let nodes = self.nodes.state();
        ClusterSnapshot::from_objects(
            version,
            pods.iter().map(AsRef::as_ref),
            nodes.iter().map(AsRef::as_ref),
            &self.internal_cidrs,
        )
    }

    /// Policies sorted by name.
    pub fn policies(&self) -> Vec<Arc<EgressGatewayPolicy>> {
        let mut policies = self.policies.state();
        policies.sort_by_key(|policy| policy.name_any());
        policies
    }
}
