//! Multi-cluster controller: attaches a `kube::runtime::watcher` for a
//! resource kind `K` against every registered tenant cluster and
//! multiplexes their events onto a single `FairQueue`. This is the
//! "generic informer cache" spec.md's Non-goals assume is available
//! from the platform; `kube::runtime::reflector::store::Store` is that
//! cache, reused rather than reimplemented.

pub mod registry;

pub use registry::{ClusterRegistry, TenantCluster};

use futures::future::BoxFuture;
use futures::StreamExt;
use kube::{
    Api, Resource,
    runtime::{
        reflector::{self, store::Store},
        watcher,
    },
};
use owo_colors::OwoColorize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::fwq::{FairQueue, QueueItem};

/// A unit of downward/upward work: a resource kind reconciler picks up
/// work items for the tenant cluster and object key they name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub cluster_key: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl QueueItem for WorkItem {
    fn tenant(&self) -> String {
        self.cluster_key.clone()
    }
}

/// Attaches and detaches per-cluster watchers for a single kind `K`,
/// feeding every observed change into the shared `FairQueue` as a
/// `WorkItem`. One `MultiClusterController<K>` exists per reconciled
/// kind (spec.md's DWS/UWS/patrol are all instantiated over this).
pub struct MultiClusterController<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    queue: FairQueue<WorkItem>,
    watchers: Mutex<HashMap<String, (CancellationToken, Store<K>)>>,
}

impl<K> MultiClusterController<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    pub fn new(queue: FairQueue<WorkItem>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Starts watching `K` on the given tenant cluster, namespaced if
    /// `namespace` is set. Idempotent: re-adding an already-watched
    /// cluster is a no-op.
    pub async fn add_cluster(self: &Arc<Self>, cluster: &TenantCluster, namespace: Option<&str>) {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(&cluster.cluster_key) {
            return;
        }
        let api: Api<K> = match namespace {
            Some(ns) => Api::namespaced(cluster.client.clone(), ns),
            None => Api::all(cluster.client.clone()),
        };
        let (store, writer) = reflector::store();
        let cancel = CancellationToken::new();
        let cluster_key = cluster.cluster_key.clone();
        let queue = self.queue.clone();
        let watch_cancel = cancel.clone();

        tokio::spawn(async move {
            let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    event = stream.next() => {
                        match event {
                            Some(Ok(watcher::Event::Apply(obj))) | Some(Ok(watcher::Event::InitApply(obj))) => {
                                queue.add(WorkItem {
                                    cluster_key: cluster_key.clone(),
                                    namespace: obj.meta().namespace.clone(),
                                    name: obj.meta().name.clone().unwrap_or_default(),
                                }).await;
                            }
                            Some(Ok(watcher::Event::Delete(obj))) => {
                                queue.add(WorkItem {
                                    cluster_key: cluster_key.clone(),
                                    namespace: obj.meta().namespace.clone(),
                                    name: obj.meta().name.clone().unwrap_or_default(),
                                }).await;
                            }
                            Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                            Some(Err(e)) => {
                                eprintln!("{}", format!("watch error on cluster {cluster_key}: {e}").red());
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        watchers.insert(cluster.cluster_key.clone(), (cancel, store));
    }

    /// Stops watching `cluster_key`, dropping its reflector store.
    pub async fn remove_cluster(&self, cluster_key: &str) {
        let mut watchers = self.watchers.lock().await;
        if let Some((cancel, _)) = watchers.remove(cluster_key) {
            cancel.cancel();
        }
    }

    /// Returns `K`'s cached copy of `name` on `cluster_key`, or `None`
    /// if the cluster isn't watched or the object isn't cached.
    pub async fn get(&self, cluster_key: &str, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let watchers = self.watchers.lock().await;
        let (_, store) = watchers.get(cluster_key)?;
        let obj_ref = kube::runtime::reflector::ObjectRef::new_with(name, K::DynamicType::default())
            .within(namespace.unwrap_or_default());
        store.get(&obj_ref)
    }

    pub async fn list(&self, cluster_key: &str) -> Vec<Arc<K>> {
        let watchers = self.watchers.lock().await;
        match watchers.get(cluster_key) {
            Some((_, store)) => store.state(),
            None => Vec::new(),
        }
    }

    pub async fn clusters(&self) -> Vec<String> {
        self.watchers.lock().await.keys().cloned().collect()
    }
}

/// Object-safe wrapper around `MultiClusterController::add_cluster`/
/// `remove_cluster` so `descriptor::reconcile` can multicast registry
/// membership changes to every watched kind's MCC without knowing their
/// concrete `K` (`ConfigMap`, `Namespace`, `Pod`, ...). This is the
/// missing half of the descriptor reconciler review flagged: previously
/// only `ctx.registry` was mutated and no MCC ever learned about it.
pub trait ClusterSink: Send + Sync {
    fn add_cluster<'a>(&'a self, cluster: &'a TenantCluster) -> BoxFuture<'a, ()>;
    fn remove_cluster<'a>(&'a self, cluster_key: &'a str) -> BoxFuture<'a, ()>;
}

impl<K> ClusterSink for Arc<MultiClusterController<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    fn add_cluster<'a>(&'a self, cluster: &'a TenantCluster) -> BoxFuture<'a, ()> {
        Box::pin(async move { MultiClusterController::add_cluster(self, cluster, None).await })
    }

    fn remove_cluster<'a>(&'a self, cluster_key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move { MultiClusterController::remove_cluster(self, cluster_key).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_tenant_is_cluster_key() {
        let item = WorkItem {
            cluster_key: "ns/name/uid".to_string(),
            namespace: Some("default".to_string()),
            name: "widget".to_string(),
        };
        assert_eq!(item.tenant(), "ns/name/uid");
    }
}
